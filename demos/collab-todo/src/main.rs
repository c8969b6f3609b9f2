//! # Collaborative Todo Demo
//!
//! Two sessions edit one project through an in-process hub. Alice drops
//! offline, keeps working, and her queued changes are rebased onto Bob's
//! when she reconnects.
//!
//! Run with `RUST_LOG=concord_core=debug` to watch the protocol.

use anyhow::Result;
use concord_core::{DispatchHub, EngineConfig, InMemoryStore};
use concord_testing::{assert_converged, TestClient};
use concord_todo::{Place, Project, TodoAction, TodoDomain};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn print_project(label: &str, project: &Project) {
    println!("{label}:");
    for list in project.lists.iter() {
        let name = project.list_names.get(list).map(String::as_str).unwrap_or("?");
        println!("  [{name}]");
        for (_, task) in project.visible_tasks(*list) {
            let mark = if task.completed { "x" } else { " " };
            let star = if task.starred { " *" } else { "" };
            println!("    [{mark}] {}{star}", task.title);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let hub = Arc::new(DispatchHub::new(InMemoryStore::<TodoDomain>::new()));
    let project = hub.create().await?;

    let config = EngineConfig::default().with_tick_interval(Duration::from_millis(250));
    let alice = TestClient::connect(&hub, project, config.clone()).await?;
    let bob = TestClient::connect(&hub, project, config).await?;

    alice
        .handle
        .dispatch(TodoAction::AddList {
            name: "Groceries".into(),
        })
        .await?;
    alice.settled_at(1, Duration::from_secs(5)).await?;

    for title in ["Milk", "Eggs", "Bread"] {
        bob.handle
            .dispatch(TodoAction::AddTask {
                list_id: 0,
                title: title.into(),
            })
            .await?;
    }
    assert_converged(&hub, project, &[&alice, &bob], Duration::from_secs(5)).await?;
    print_project("Shared", &alice.view().present);

    println!("\nAlice goes offline and reorders; Bob deletes her anchor.");
    alice.handle.go_offline().await?;
    alice
        .handle
        .dispatch(TodoAction::MoveTask {
            task_id: 2,
            to_list: 0,
            place: Place::Before { anchor: 1 },
        })
        .await?;
    alice.handle.dispatch(TodoAction::StarTask { task_id: 2 }).await?;
    bob.handle
        .dispatch(TodoAction::DeleteTask {
            task_id: 1,
            user_id: "bob".into(),
        })
        .await?;
    bob.handle.dispatch(TodoAction::CompleteTask { task_id: 0 }).await?;

    let offline = alice.handle.wait_for(|view| view.pending == 2).await?;
    print_project("Alice (offline)", &offline.present);

    alice.handle.go_online().await?;
    assert_converged(&hub, project, &[&alice, &bob], Duration::from_secs(5)).await?;

    let snapshot = hub.snapshot(project).await?;
    println!();
    print_project(&format!("Converged at version {}", snapshot.version), &snapshot.model);

    for entry in hub.audit_log(project).await? {
        println!(
            "  v{} {:?} -> {:?}",
            entry.record.base_version, entry.record.orig, entry.record.outcome
        );
    }

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}
