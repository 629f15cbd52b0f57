use criterion::{criterion_group, criterion_main, Criterion};
use jottask_core::{
    build_task_digest, ProjectId, ProjectItem, ProjectItemId, ProjectProgress, Task, TaskId,
    TaskPriority, TaskStatus, UserId,
};
use time::macros::date;
use time::{Duration, OffsetDateTime};

fn mk_task(index: usize, user_id: UserId) -> Task {
    let offset = i64::try_from(index % 30).unwrap_or_default() - 10;
    let due_date = if index % 7 == 0 {
        None
    } else {
        date!(2026 - 04 - 10).checked_add(Duration::days(offset))
    };
    let status = if index % 5 == 0 {
        TaskStatus::Completed
    } else {
        TaskStatus::Pending
    };

    Task {
        id: TaskId::new(),
        user_id,
        title: format!("bench task {index}"),
        description: None,
        due_date,
        due_time: None,
        priority: TaskPriority::Medium,
        status,
        category: Some("email".to_string()),
        client_name: None,
        client_email: None,
        business_id: None,
        contact_id: None,
        reminder_sent_at: None,
        created_at: OffsetDateTime::UNIX_EPOCH,
        completed_at: None,
    }
}

fn bench_digest(c: &mut Criterion) {
    let user_id = UserId::new();
    let tasks = (0..1_000).map(|index| mk_task(index, user_id)).collect::<Vec<_>>();
    let today = date!(2026 - 04 - 10);

    c.bench_function("task_digest_1000", |b| {
        b.iter(|| build_task_digest(&tasks, today));
    });
}

fn bench_progress(c: &mut Criterion) {
    let project_id = ProjectId::new();
    let items = (0..1_000_i64)
        .map(|index| ProjectItem {
            id: ProjectItemId::new(),
            project_id,
            title: format!("item {index}"),
            is_completed: index % 3 == 0,
            display_order: index,
            created_at: OffsetDateTime::UNIX_EPOCH,
        })
        .collect::<Vec<_>>();

    c.bench_function("project_progress_1000", |b| {
        b.iter(|| ProjectProgress::from_items(&items));
    });
}

criterion_group!(benches, bench_digest, bench_progress);
criterion_main!(benches);
