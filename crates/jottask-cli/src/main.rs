use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use jottask_api::logging::LoggingConfig;
use jottask_api::JottaskApi;
use jottask_core::dates::{parse_clock, parse_date};
use jottask_core::{
    AccountSeed, ActionKind, ActionPayload, ActionToken, ContactId, CredentialResolver,
    CredentialSource, CrmConnectionId, CrmConnectionStatus, CrmProvider, EmailConnectionId,
    EmailProvider, Identity, InboundEmail, NewContact, NewCrmConnection, NewEmailConnection,
    NewPendingAction, NewProject, NewProjectItem, NewReferral, NewTask, NewUser,
    PendingActionStatus, ProjectId, ProjectItemId, ProjectStatus, ReferralStatus, SeedMode,
    SharedCredentials, SubscriptionStatus, SupportConversationId, SupportConversationStatus,
    TaskId, TaskPriority, TaskStatus, UserId, UserProfileUpdate,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime, Time};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "jt")]
#[command(about = "Jottask task and notification store CLI")]
struct Cli {
    #[arg(long, env = "JOTTASK_DB", default_value = "./jottask.sqlite3")]
    db: PathBuf,

    /// Act as this account owner instead of the service identity.
    #[arg(long)]
    as_user: Option<UserId>,

    #[arg(long, env = "JOTTASK_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[arg(long, env = "JOTTASK_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,

    #[arg(long, env = "JOTTASK_SHARED_IMAP_PASSWORD", hide_env_values = true)]
    shared_imap_password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
    Project {
        #[command(subcommand)]
        command: Box<ProjectCommand>,
    },
    Contact {
        #[command(subcommand)]
        command: Box<ContactCommand>,
    },
    Email {
        #[command(subcommand)]
        command: Box<EmailCommand>,
    },
    Action {
        #[command(subcommand)]
        command: Box<ActionCommand>,
    },
    Crm {
        #[command(subcommand)]
        command: Box<CrmCommand>,
    },
    Referral {
        #[command(subcommand)]
        command: ReferralCommand,
    },
    Support {
        #[command(subcommand)]
        command: SupportCommand,
    },
    /// Apply a YAML account seed to an existing user.
    Seed(SeedArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    Reapply {
        #[arg(long)]
        version: i64,
    },
    Backup {
        #[arg(long)]
        out: PathBuf,
    },
    Restore {
        #[arg(long = "in")]
        input: PathBuf,
    },
    IntegrityCheck,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        id: Option<UserId>,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        company_name: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
    },
    Show {
        #[arg(long)]
        id: UserId,
    },
    Find {
        #[arg(long)]
        email: String,
    },
    Update(UserUpdateArgs),
    SetSubscription {
        #[arg(long)]
        id: UserId,
        #[arg(long, value_parser = enum_arg("subscription status", SubscriptionStatus::parse))]
        status: SubscriptionStatus,
    },
    Delete {
        #[arg(long)]
        id: UserId,
    },
}

#[derive(Debug, Args)]
struct UserUpdateArgs {
    #[arg(long)]
    id: UserId,
    #[arg(long)]
    full_name: Option<String>,
    #[arg(long)]
    company_name: Option<String>,
    #[arg(long)]
    timezone: Option<String>,
    #[arg(long)]
    ai_context: Option<String>,
    #[arg(long, action = ArgAction::Set)]
    onboarding_completed: Option<bool>,
    #[arg(long, action = ArgAction::Set)]
    daily_summary_enabled: Option<bool>,
    #[arg(long, value_parser = parse_clock)]
    daily_summary_time: Option<Time>,
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    Add(Box<TaskAddArgs>),
    Show {
        #[arg(long)]
        id: TaskId,
    },
    List {
        #[arg(long)]
        user: UserId,
        #[arg(long, value_parser = enum_arg("task status", TaskStatus::parse))]
        status: Option<TaskStatus>,
    },
    SetStatus {
        #[arg(long)]
        id: TaskId,
        #[arg(long, value_parser = enum_arg("task status", TaskStatus::parse))]
        status: TaskStatus,
    },
    Delete {
        #[arg(long)]
        id: TaskId,
    },
    ReminderSent {
        #[arg(long)]
        id: TaskId,
    },
    Digest {
        #[arg(long)]
        user: UserId,
        /// Reference date; defaults to the current UTC date.
        #[arg(long, value_parser = parse_date)]
        today: Option<Date>,
    },
}

#[derive(Debug, Args)]
struct TaskAddArgs {
    #[arg(long)]
    user: UserId,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_parser = parse_date)]
    due_date: Option<Date>,
    #[arg(long, value_parser = parse_clock)]
    due_time: Option<Time>,
    #[arg(long, value_parser = enum_arg("task priority", TaskPriority::parse))]
    priority: Option<TaskPriority>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    client_name: Option<String>,
    #[arg(long)]
    client_email: Option<String>,
    #[arg(long)]
    business_id: Option<String>,
    #[arg(long)]
    contact: Option<ContactId>,
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    Add {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        color: Option<String>,
    },
    Show {
        #[arg(long)]
        id: ProjectId,
    },
    List {
        #[arg(long)]
        user: UserId,
    },
    SetStatus {
        #[arg(long)]
        id: ProjectId,
        #[arg(long, value_parser = enum_arg("project status", ProjectStatus::parse))]
        status: ProjectStatus,
    },
    Delete {
        #[arg(long)]
        id: ProjectId,
    },
    AddItem {
        #[arg(long)]
        project: ProjectId,
        #[arg(long)]
        title: String,
        #[arg(long)]
        order: Option<i64>,
    },
    ShowItem {
        #[arg(long)]
        id: ProjectItemId,
    },
    Items {
        #[arg(long)]
        project: ProjectId,
    },
    CompleteItem {
        #[arg(long)]
        id: ProjectItemId,
        /// Mark the item as not completed instead.
        #[arg(long, default_value_t = false)]
        undo: bool,
    },
    Progress {
        #[arg(long)]
        id: ProjectId,
    },
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    Upsert {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
    Show {
        #[arg(long)]
        id: ContactId,
    },
    List {
        #[arg(long)]
        user: UserId,
    },
    Delete {
        #[arg(long)]
        id: ContactId,
    },
    History {
        #[arg(long)]
        id: ContactId,
    },
    /// Derive contacts from historical task client emails.
    Backfill,
}

#[derive(Debug, Subcommand)]
enum EmailCommand {
    Save {
        #[arg(long)]
        user: UserId,
        #[arg(long, value_parser = enum_arg("email provider", EmailProvider::parse))]
        provider: EmailProvider,
        #[arg(long)]
        address: String,
        #[arg(long)]
        imap_server: Option<String>,
        #[arg(long)]
        imap_password: Option<String>,
        #[arg(long, value_parser = enum_arg("credential source", CredentialSource::parse))]
        credential_source: Option<CredentialSource>,
    },
    Show {
        #[arg(long)]
        id: EmailConnectionId,
    },
    List {
        #[arg(long)]
        user: UserId,
    },
    SetActive {
        #[arg(long)]
        id: EmailConnectionId,
        #[arg(long, action = ArgAction::Set)]
        active: bool,
    },
    Checked {
        #[arg(long)]
        id: EmailConnectionId,
    },
    Delete {
        #[arg(long)]
        id: EmailConnectionId,
    },
    Credentials {
        #[arg(long)]
        id: EmailConnectionId,
    },
    Ingest(Box<IngestArgs>),
    Processed {
        #[arg(long)]
        user: UserId,
    },
    IsProcessed {
        #[arg(long)]
        message_id: String,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    message_id: String,
    #[arg(long)]
    user: UserId,
    #[arg(long)]
    sender_email: Option<String>,
    #[arg(long)]
    sender_name: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_parser = parse_date)]
    due_date: Option<Date>,
    #[arg(long, value_parser = parse_clock)]
    due_time: Option<Time>,
    #[arg(long, value_parser = enum_arg("task priority", TaskPriority::parse))]
    priority: Option<TaskPriority>,
}

#[derive(Debug, Subcommand)]
enum ActionCommand {
    Create(Box<ActionCreateArgs>),
    Show {
        #[arg(long, value_parser = ActionToken::parse)]
        token: ActionToken,
    },
    List {
        #[arg(long)]
        user: Option<UserId>,
        #[arg(long, value_parser = enum_arg("action status", PendingActionStatus::parse))]
        status: Option<PendingActionStatus>,
    },
    Approve {
        #[arg(long, value_parser = ActionToken::parse)]
        token: ActionToken,
    },
    Reject {
        #[arg(long, value_parser = ActionToken::parse)]
        token: ActionToken,
    },
    Fail {
        #[arg(long, value_parser = ActionToken::parse)]
        token: ActionToken,
        #[arg(long)]
        reason: String,
    },
    ExpireStale {
        /// RFC 3339 reference instant; defaults to now.
        #[arg(long, value_parser = timestamp_arg)]
        now: Option<OffsetDateTime>,
    },
    CrmSynced {
        #[arg(long, value_parser = ActionToken::parse)]
        token: ActionToken,
    },
}

#[derive(Debug, Args)]
struct ActionCreateArgs {
    #[arg(long)]
    user: Option<UserId>,
    #[arg(long, value_parser = enum_arg("action kind", ActionKind::parse))]
    kind: ActionKind,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    customer_name: Option<String>,
    #[arg(long)]
    crm_notes: Option<String>,
    #[arg(long)]
    calendar_details: Option<String>,
    #[arg(long)]
    deal_status: Option<String>,
    #[arg(long, value_parser = parse_date)]
    due_date: Option<Date>,
    #[arg(long, value_parser = parse_clock)]
    due_time: Option<Time>,
    #[arg(long)]
    expires_in_days: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum CrmCommand {
    Save {
        #[arg(long)]
        user: UserId,
        #[arg(long, value_parser = enum_arg("crm provider", CrmProvider::parse))]
        provider: CrmProvider,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        api_base_url: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        /// Credentials were already checked against the provider.
        #[arg(long, default_value_t = false)]
        verified: bool,
    },
    Show {
        #[arg(long)]
        id: CrmConnectionId,
    },
    SetStatus {
        #[arg(long)]
        id: CrmConnectionId,
        #[arg(long, value_parser = enum_arg("crm connection status", CrmConnectionStatus::parse))]
        status: CrmConnectionStatus,
        #[arg(long)]
        error: Option<String>,
    },
    List {
        #[arg(long)]
        user: UserId,
    },
    Active {
        #[arg(long)]
        user: UserId,
    },
    Delete {
        #[arg(long)]
        id: CrmConnectionId,
    },
}

#[derive(Debug, Subcommand)]
enum ReferralCommand {
    Record {
        #[arg(long)]
        referrer: UserId,
        #[arg(long)]
        referred: UserId,
    },
    Advance {
        #[arg(long)]
        referred: UserId,
        #[arg(long, value_parser = enum_arg("referral status", ReferralStatus::parse))]
        status: ReferralStatus,
    },
    List {
        #[arg(long)]
        user: UserId,
    },
}

#[derive(Debug, Subcommand)]
enum SupportCommand {
    Open {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        subject: String,
    },
    SetStatus {
        #[arg(long)]
        id: SupportConversationId,
        #[arg(long, value_parser = enum_arg("support status", SupportConversationStatus::parse))]
        status: SupportConversationStatus,
    },
    List {
        #[arg(long)]
        user: UserId,
        #[arg(long, value_parser = enum_arg("support status", SupportConversationStatus::parse))]
        status: Option<SupportConversationStatus>,
    },
}

#[derive(Debug, Args)]
struct SeedArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long, value_enum, default_value_t = SeedModeArg::Preserve)]
    mode: SeedModeArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SeedModeArg {
    Preserve,
    Overwrite,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl LogFormatArg {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

fn enum_arg<T>(
    what: &'static str,
    parse: fn(&str) -> Option<T>,
) -> impl Fn(&str) -> Result<T, String> + Clone + Send + Sync + 'static
where
    T: 'static,
{
    move |raw: &str| parse(raw.trim()).ok_or_else(|| format!("unknown {what} `{raw}`"))
}

fn timestamp_arg(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    LoggingConfig::new(cli.log_level.clone(), cli.log_format.as_str()).init()?;

    let api = JottaskApi::new(cli.db.clone());
    let identity = cli.as_user.map_or(Identity::Service, Identity::Owner);
    tracing::debug!(db = %cli.db.display(), ?identity, "running command");

    match cli.command {
        Command::Db { command } => run_db(&api, command),
        Command::User { command } => run_user(&api, identity, *command),
        Command::Task { command } => run_task(&api, identity, *command),
        Command::Project { command } => run_project(&api, identity, *command),
        Command::Contact { command } => run_contact(&api, identity, *command),
        Command::Email { command } => {
            let resolver = credential_resolver(cli.shared_imap_password.as_deref());
            run_email(&api, identity, &resolver, *command)
        }
        Command::Action { command } => run_action(&api, identity, *command),
        Command::Crm { command } => run_crm(&api, identity, *command),
        Command::Referral { command } => run_referral(&api, identity, command),
        Command::Support { command } => run_support(&api, identity, command),
        Command::Seed(args) => run_seed(&api, identity, &args),
    }
}

fn credential_resolver(shared_password: Option<&str>) -> CredentialResolver {
    match shared_password.filter(|password| !password.is_empty()) {
        Some(password) => CredentialResolver::new().with_shared(SharedCredentials::new(password)),
        None => CredentialResolver::new(),
    }
}

fn run_db(api: &JottaskApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate { dry_run } => emit(&api.migrate(dry_run)?),
        DbCommand::Reapply { version } => emit(&api.reapply_migration(version)?),
        DbCommand::Backup { out } => {
            api.backup(&out)?;
            emit_json(serde_json::json!({
                "backup_path": out,
                "status": "ok"
            }))
        }
        DbCommand::Restore { input } => {
            api.restore(&input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_user(api: &JottaskApi, identity: Identity, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Create {
            email,
            id,
            full_name,
            company_name,
            timezone,
        } => emit(
            &api.create_user(identity, &NewUser {
                id,
                email,
                full_name,
                company_name,
                timezone,
            })?,
        ),
        UserCommand::Show { id } => emit(&api.get_user(identity, id)?),
        UserCommand::Find { email } => {
            let user = api.find_user_by_email(identity, &email)?;
            emit_json(serde_json::json!({ "email": email, "user": user }))
        }
        UserCommand::Update(args) => {
            let update = UserProfileUpdate {
                full_name: args.full_name,
                company_name: args.company_name,
                timezone: args.timezone,
                ai_context: args.ai_context,
                onboarding_completed: args.onboarding_completed,
                daily_summary_enabled: args.daily_summary_enabled,
                daily_summary_time: args.daily_summary_time,
            };
            emit(&api.update_user_profile(identity, args.id, &update)?)
        }
        UserCommand::SetSubscription { id, status } => {
            emit(&api.set_subscription_status(identity, id, status)?)
        }
        UserCommand::Delete { id } => {
            api.delete_user(identity, id)?;
            emit_json(serde_json::json!({ "deleted_user_id": id }))
        }
    }
}

fn run_task(api: &JottaskApi, identity: Identity, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Add(args) => {
            let task = NewTask {
                description: args.description,
                due_date: args.due_date,
                due_time: args.due_time,
                priority: args.priority.unwrap_or_default(),
                category: args.category,
                client_name: args.client_name,
                client_email: args.client_email,
                business_id: args.business_id,
                contact_id: args.contact,
                ..NewTask::new(args.user, args.title)
            };
            emit(&api.create_task(identity, &task)?)
        }
        TaskCommand::Show { id } => emit(&api.get_task(identity, id)?),
        TaskCommand::List { user, status } => {
            let tasks = api.list_tasks(identity, user, status)?;
            emit_json(serde_json::json!({ "user_id": user, "tasks": tasks }))
        }
        TaskCommand::SetStatus { id, status } => emit(&api.set_task_status(identity, id, status)?),
        TaskCommand::Delete { id } => {
            api.delete_task(identity, id)?;
            emit_json(serde_json::json!({ "deleted_task_id": id }))
        }
        TaskCommand::ReminderSent { id } => emit(&api.mark_reminder_sent(identity, id)?),
        TaskCommand::Digest { user, today } => emit(&api.task_digest(identity, user, today)?),
    }
}

fn run_project(api: &JottaskApi, identity: Identity, command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::Add { user, name, color } => {
            emit(&api.create_project(identity, &NewProject {
                user_id: user,
                name,
                color,
            })?)
        }
        ProjectCommand::Show { id } => emit(&api.get_project(identity, id)?),
        ProjectCommand::List { user } => {
            let projects = api.list_projects(identity, user)?;
            emit_json(serde_json::json!({ "user_id": user, "projects": projects }))
        }
        ProjectCommand::SetStatus { id, status } => {
            emit(&api.set_project_status(identity, id, status)?)
        }
        ProjectCommand::Delete { id } => {
            api.delete_project(identity, id)?;
            emit_json(serde_json::json!({ "deleted_project_id": id }))
        }
        ProjectCommand::AddItem {
            project,
            title,
            order,
        } => emit(&api.add_project_item(
            identity,
            &NewProjectItem {
                project_id: project,
                title,
                display_order: order,
            },
        )?),
        ProjectCommand::ShowItem { id } => emit(&api.get_project_item(identity, id)?),
        ProjectCommand::Items { project } => {
            let items = api.list_project_items(identity, project)?;
            emit_json(serde_json::json!({ "project_id": project, "items": items }))
        }
        ProjectCommand::CompleteItem { id, undo } => {
            emit(&api.set_project_item_completed(identity, id, !undo)?)
        }
        ProjectCommand::Progress { id } => {
            let progress = api.project_progress(identity, id)?;
            emit_json(serde_json::json!({ "project_id": id, "progress": progress }))
        }
    }
}

fn run_contact(api: &JottaskApi, identity: Identity, command: ContactCommand) -> Result<()> {
    match command {
        ContactCommand::Upsert {
            user,
            name,
            email,
            phone,
            company,
        } => emit(
            &api.upsert_contact(identity, &NewContact {
                user_id: user,
                name,
                email,
                phone,
                company,
            })?,
        ),
        ContactCommand::Show { id } => emit(&api.get_contact(identity, id)?),
        ContactCommand::List { user } => {
            let contacts = api.list_contacts(identity, user)?;
            emit_json(serde_json::json!({ "user_id": user, "contacts": contacts }))
        }
        ContactCommand::Delete { id } => {
            api.delete_contact(identity, id)?;
            emit_json(serde_json::json!({ "deleted_contact_id": id }))
        }
        ContactCommand::History { id } => {
            let emails = api.contact_history(identity, id)?;
            emit_json(serde_json::json!({ "contact_id": id, "emails": emails }))
        }
        ContactCommand::Backfill => emit(&api.backfill_contacts(identity)?),
    }
}

fn run_email(
    api: &JottaskApi,
    identity: Identity,
    resolver: &CredentialResolver,
    command: EmailCommand,
) -> Result<()> {
    match command {
        EmailCommand::Save {
            user,
            provider,
            address,
            imap_server,
            imap_password,
            credential_source,
        } => {
            let connection = NewEmailConnection {
                user_id: user,
                provider,
                email_address: address,
                imap_server,
                imap_password,
                credential_source: credential_source.unwrap_or_default(),
            };
            emit(&api.save_email_connection(identity, &connection)?)
        }
        EmailCommand::Show { id } => emit(&api.get_email_connection(identity, id)?),
        EmailCommand::List { user } => {
            let connections = api.list_email_connections(identity, user)?;
            emit_json(serde_json::json!({ "user_id": user, "connections": connections }))
        }
        EmailCommand::SetActive { id, active } => {
            emit(&api.set_email_connection_active(identity, id, active)?)
        }
        EmailCommand::Checked { id } => emit(&api.mark_email_checked(identity, id)?),
        EmailCommand::Delete { id } => {
            api.delete_email_connection(identity, id)?;
            emit_json(serde_json::json!({ "deleted_connection_id": id }))
        }
        EmailCommand::Credentials { id } => {
            emit(&api.resolve_email_credentials(identity, id, resolver)?)
        }
        EmailCommand::Ingest(args) => {
            let email = InboundEmail {
                message_id: args.message_id,
                user_id: args.user,
                sender_email: args.sender_email,
                sender_name: args.sender_name,
                subject: args.subject,
                title: args.title,
                description: args.description,
                due_date: args.due_date,
                due_time: args.due_time,
                priority: args.priority.unwrap_or_default(),
            };
            emit(&api.ingest_email(identity, &email)?)
        }
        EmailCommand::Processed { user } => {
            let emails = api.list_processed_emails(identity, user)?;
            emit_json(serde_json::json!({ "user_id": user, "emails": emails }))
        }
        EmailCommand::IsProcessed { message_id } => {
            let processed = api.is_email_processed(identity, &message_id)?;
            emit_json(serde_json::json!({ "message_id": message_id, "processed": processed }))
        }
    }
}

fn run_action(api: &JottaskApi, identity: Identity, command: ActionCommand) -> Result<()> {
    match command {
        ActionCommand::Create(args) => {
            let payload = ActionPayload {
                description: args.description,
                customer_name: args.customer_name,
                crm_notes: args.crm_notes,
                calendar_details: args.calendar_details,
                deal_status: args.deal_status,
                due_date: args.due_date,
                due_time: args.due_time,
                ..ActionPayload::new(args.kind, args.title)
            };
            let action = NewPendingAction {
                user_id: args.user,
                payload,
                expires_in_days: args.expires_in_days,
            };
            emit(&api.create_pending_action(identity, &action)?)
        }
        ActionCommand::Show { token } => emit(&api.get_pending_action(identity, &token)?),
        ActionCommand::List { user, status } => {
            let actions = api.list_pending_actions(identity, user, status)?;
            emit_json(serde_json::json!({ "actions": actions }))
        }
        ActionCommand::Approve { token } => emit(&api.approve_pending_action(identity, &token)?),
        ActionCommand::Reject { token } => emit(&api.reject_pending_action(identity, &token)?),
        ActionCommand::Fail { token, reason } => {
            emit(&api.fail_pending_action(identity, &token, &reason)?)
        }
        ActionCommand::ExpireStale { now } => emit(&api.expire_stale_actions(identity, now)?),
        ActionCommand::CrmSynced { token } => emit(&api.mark_crm_synced(identity, &token)?),
    }
}

fn run_crm(api: &JottaskApi, identity: Identity, command: CrmCommand) -> Result<()> {
    match command {
        CrmCommand::Save {
            user,
            provider,
            api_key,
            api_base_url,
            display_name,
            verified,
        } => {
            let connection = NewCrmConnection {
                user_id: user,
                provider,
                api_key,
                api_base_url,
                display_name,
                verified,
            };
            emit(&api.save_crm_connection(identity, &connection)?)
        }
        CrmCommand::Show { id } => emit(&api.get_crm_connection(identity, id)?),
        CrmCommand::SetStatus { id, status, error } => {
            emit(&api.set_crm_connection_status(identity, id, status, error.as_deref())?)
        }
        CrmCommand::List { user } => {
            let connections = api.list_crm_connections(identity, user)?;
            emit_json(serde_json::json!({ "user_id": user, "connections": connections }))
        }
        CrmCommand::Active { user } => {
            let connection = api.active_crm_connection(identity, user)?;
            emit_json(serde_json::json!({ "user_id": user, "connection": connection }))
        }
        CrmCommand::Delete { id } => {
            api.delete_crm_connection(identity, id)?;
            emit_json(serde_json::json!({ "deleted_connection_id": id }))
        }
    }
}

fn run_referral(api: &JottaskApi, identity: Identity, command: ReferralCommand) -> Result<()> {
    match command {
        ReferralCommand::Record { referrer, referred } => emit(&api.record_referral(
            identity,
            &NewReferral {
                referrer_id: referrer,
                referred_id: referred,
            },
        )?),
        ReferralCommand::Advance { referred, status } => {
            emit(&api.advance_referral(identity, referred, status)?)
        }
        ReferralCommand::List { user } => {
            let referrals = api.list_referrals(identity, user)?;
            emit_json(serde_json::json!({ "user_id": user, "referrals": referrals }))
        }
    }
}

fn run_support(api: &JottaskApi, identity: Identity, command: SupportCommand) -> Result<()> {
    match command {
        SupportCommand::Open { user, subject } => {
            emit(&api.open_support_conversation(identity, user, &subject)?)
        }
        SupportCommand::SetStatus { id, status } => {
            emit(&api.set_support_conversation_status(identity, id, status)?)
        }
        SupportCommand::List { user, status } => {
            let conversations = api.list_support_conversations(identity, user, status)?;
            emit_json(serde_json::json!({ "user_id": user, "conversations": conversations }))
        }
    }
}

fn run_seed(api: &JottaskApi, identity: Identity, args: &SeedArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read seed file {}", args.file.display()))?;
    let seed: AccountSeed = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse seed file {}", args.file.display()))?;
    let mode = match args.mode {
        SeedModeArg::Preserve => SeedMode::Preserve,
        SeedModeArg::Overwrite => SeedMode::Overwrite,
    };
    emit(&api.seed_account(identity, &seed, mode)?)
}
