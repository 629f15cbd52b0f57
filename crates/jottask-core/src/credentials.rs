//! IMAP credential providers for email connections.

use std::fmt::{Debug, Formatter};

use serde::Serialize;

use crate::model::EmailConnection;
use crate::status::CredentialSource;
use crate::CoreError;

pub trait CredentialProvider: Send + Sync {
    fn source(&self) -> CredentialSource;

    /// # Errors
    /// Returns `Credentials` when no secret is available for `connection`.
    fn imap_password(&self, connection: &EmailConnection) -> Result<String, CoreError>;
}

/// Reads the secret stored on the connection row.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredCredentials;

impl CredentialProvider for StoredCredentials {
    fn source(&self) -> CredentialSource {
        CredentialSource::Stored
    }

    fn imap_password(&self, connection: &EmailConnection) -> Result<String, CoreError> {
        connection
            .imap_password
            .clone()
            .filter(|password| !password.is_empty())
            .ok_or_else(|| {
                CoreError::Credentials(format!(
                    "no stored password for {}",
                    connection.email_address
                ))
            })
    }
}

/// One deployment-wide secret shared by every connection that opts in.
#[derive(Clone)]
pub struct SharedCredentials {
    password: String,
}

impl SharedCredentials {
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl Debug for SharedCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCredentials")
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CredentialProvider for SharedCredentials {
    fn source(&self) -> CredentialSource {
        CredentialSource::Shared
    }

    fn imap_password(&self, _connection: &EmailConnection) -> Result<String, CoreError> {
        if self.password.is_empty() {
            return Err(CoreError::Credentials("shared password is empty".to_string()));
        }
        Ok(self.password.clone())
    }
}

#[derive(Clone, Serialize)]
pub struct ResolvedCredentials {
    pub source: CredentialSource,
    pub username: String,
    pub imap_server: Option<String>,
    #[serde(skip)]
    pub password: String,
}

impl Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("source", &self.source)
            .field("username", &self.username)
            .field("imap_server", &self.imap_server)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Picks the provider that matches each connection's credential source.
pub struct CredentialResolver {
    stored: Box<dyn CredentialProvider>,
    shared: Option<Box<dyn CredentialProvider>>,
}

impl CredentialResolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stored: Box::new(StoredCredentials),
            shared: None,
        }
    }

    #[must_use]
    pub fn with_shared(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.shared = Some(Box::new(provider));
        self
    }

    #[must_use]
    pub fn with_stored(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.stored = Box::new(provider);
        self
    }

    /// # Errors
    /// Returns `Credentials` when the connection is inactive, uses shared
    /// credentials without a configured shared provider, or the provider has
    /// no secret.
    pub fn resolve(&self, connection: &EmailConnection) -> Result<ResolvedCredentials, CoreError> {
        if !connection.is_active {
            return Err(CoreError::Credentials(format!(
                "connection {} is inactive",
                connection.email_address
            )));
        }

        let provider = match connection.credential_source {
            CredentialSource::Stored => self.stored.as_ref(),
            CredentialSource::Shared => self.shared.as_deref().ok_or_else(|| {
                CoreError::Credentials("no shared credential provider configured".to_string())
            })?,
        };

        Ok(ResolvedCredentials {
            source: provider.source(),
            username: connection.email_address.clone(),
            imap_server: connection.imap_server.clone(),
            password: provider.imap_password(connection)?,
        })
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}
