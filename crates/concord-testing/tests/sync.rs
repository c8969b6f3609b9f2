//! End-to-end sessions against an in-process hub.

use concord_core::{
    DispatchHub, EngineConfig, HubConfig, InMemoryStore, RequestOutcome, SyncStatus,
};
use concord_testing::{assert_converged, TestClient};
use concord_todo::{ListPlace, Place, Project, TodoAction, TodoDomain};
use std::sync::Arc;
use std::time::Duration;

type Hub = DispatchHub<TodoDomain, InMemoryStore<TodoDomain>>;

const WAIT: Duration = Duration::from_secs(5);

fn hub() -> Arc<Hub> {
    Arc::new(
        DispatchHub::new(InMemoryStore::new())
            .with_config(HubConfig::default().with_broadcast_capacity(256)),
    )
}

fn add_list(name: &str) -> TodoAction {
    TodoAction::AddList { name: name.into() }
}

fn add_task(list_id: u64, title: &str) -> TodoAction {
    TodoAction::AddTask {
        list_id,
        title: title.into(),
    }
}

/// A resource with an "Inbox" list holding tasks a, b and c.
async fn seeded(hub: &Hub) -> concord_core::ResourceId {
    let id = hub.create().await.unwrap();
    for (version, action) in [
        add_list("Inbox"),
        add_task(0, "a"),
        add_task(0, "b"),
        add_task(0, "c"),
    ]
    .into_iter()
    .enumerate()
    {
        hub.dispatch(id, version as u64, action).await.unwrap();
    }
    id
}

fn lane(project: &Project) -> Vec<u64> {
    project.lane(0).iter().copied().collect()
}

#[tokio::test]
async fn single_client_round_trip() {
    let hub = hub();
    let id = hub.create().await.unwrap();
    let client = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    client.handle.dispatch(add_list("Inbox")).await.unwrap();
    let view = client.settled_at(1, WAIT).await.unwrap();

    assert_eq!(view.status, SyncStatus::Synced);
    assert_eq!(view.present.list_by_name("inbox"), Some(0));
    assert_eq!(hub.snapshot(id).await.unwrap().model, view.present);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_list_delete_is_accepted_without_change() {
    let hub = hub();
    let id = seeded(&hub).await;
    let a = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();
    let b = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    a.handle.go_offline().await.unwrap();
    b.handle.go_offline().await.unwrap();
    a.handle.dispatch(TodoAction::DeleteList { list_id: 0 }).await.unwrap();
    b.handle.dispatch(TodoAction::DeleteList { list_id: 0 }).await.unwrap();
    a.handle.go_online().await.unwrap();
    a.settled_at(5, WAIT).await.unwrap();
    b.handle.go_online().await.unwrap();

    assert_converged(&hub, id, &[&a, &b], WAIT).await.unwrap();
    let snapshot = hub.snapshot(id).await.unwrap();
    assert_eq!(snapshot.version, 6);
    assert!(snapshot.model.lists.is_empty());

    let audit = hub.audit_log(id).await.unwrap();
    let last = audit.last().unwrap();
    assert!(matches!(
        last.record.outcome,
        RequestOutcome::AuditAccepted { no_change: true, .. }
    ));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn offline_actions_are_queued_then_flushed_in_order() {
    let hub = hub();
    let id = seeded(&hub).await;
    let client = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    client.handle.go_offline().await.unwrap();
    client.handle.dispatch(add_task(0, "d")).await.unwrap();
    client.handle.dispatch(add_task(0, "e")).await.unwrap();
    client
        .handle
        .dispatch(TodoAction::CompleteTask { task_id: 3 })
        .await
        .unwrap();

    let view = client
        .handle
        .wait_for(|view| view.pending == 3)
        .await
        .unwrap();
    assert_eq!(view.status, SyncStatus::Offline);
    assert_eq!(lane(&view.present), vec![0, 1, 2, 3, 4]);
    assert_eq!(hub.snapshot(id).await.unwrap().version, 4);
    assert_eq!(client.faults.requests(), 0);

    client.handle.go_online().await.unwrap();
    let view = client.settled_at(7, WAIT).await.unwrap();
    assert!(view.present.task(3).unwrap().completed);
    assert_eq!(hub.snapshot(id).await.unwrap().model, view.present);
    assert_eq!(client.faults.requests(), 3);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_server_takes_the_session_offline() {
    let hub = hub();
    let id = seeded(&hub).await;
    let client = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    client.faults.set_offline(true);
    client.handle.dispatch(add_task(0, "d")).await.unwrap();
    let view = client
        .handle
        .wait_for(|view| view.status == SyncStatus::Offline)
        .await
        .unwrap();
    assert_eq!(view.pending, 1);

    client.faults.set_offline(false);
    client.handle.network_restored().await.unwrap();
    client.settled_at(5, WAIT).await.unwrap();

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn conflicts_are_retried_on_fresh_state() {
    let hub = hub();
    let id = seeded(&hub).await;
    let client = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    client.faults.inject_conflicts(3);
    client.handle.dispatch(add_task(0, "d")).await.unwrap();
    client.settled_at(5, WAIT).await.unwrap();
    assert_eq!(client.faults.requests(), 4);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_session_keeps_its_queue_until_the_next_tick() {
    let hub = hub();
    let id = seeded(&hub).await;
    let client = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    client.faults.inject_conflicts(usize::MAX);
    client.handle.dispatch(add_task(0, "d")).await.unwrap();
    let view = client
        .handle
        .wait_for(|view| view.status == SyncStatus::Exhausted)
        .await
        .unwrap();
    assert_eq!(view.pending, 1);
    assert_eq!(client.faults.requests(), 6);
    assert_eq!(hub.snapshot(id).await.unwrap().version, 4);

    client.faults.inject_conflicts(0);
    client.handle.tick().await.unwrap();
    let view = client.settled_at(5, WAIT).await.unwrap();
    assert_eq!(view.present.task_by_title(0, "d"), Some(3));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn anchored_move_falls_back_when_the_anchor_is_deleted() {
    let hub = hub();
    let id = seeded(&hub).await;
    let client = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    client.handle.go_offline().await.unwrap();
    client
        .handle
        .dispatch(TodoAction::MoveTask {
            task_id: 0,
            to_list: 0,
            place: Place::After { anchor: 1 },
        })
        .await
        .unwrap();
    let view = client.handle.wait_for(|view| view.pending == 1).await.unwrap();
    assert_eq!(lane(&view.present), vec![1, 0, 2]);

    hub.dispatch(
        id,
        4,
        TodoAction::DeleteTask {
            task_id: 1,
            user_id: "bob".into(),
        },
    )
    .await
    .unwrap();

    client.handle.go_online().await.unwrap();
    let view = client.settled_at(6, WAIT).await.unwrap();
    assert_eq!(lane(&view.present), vec![2, 0]);
    assert!(view.present.task(1).is_none());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn deleted_task_swallows_concurrent_edits() {
    let hub = hub();
    let id = seeded(&hub).await;
    let a = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();
    let b = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    b.handle.go_offline().await.unwrap();
    b.handle.dispatch(TodoAction::StarTask { task_id: 2 }).await.unwrap();
    a.handle
        .dispatch(TodoAction::DeleteTask {
            task_id: 2,
            user_id: "alice".into(),
        })
        .await
        .unwrap();
    a.settled_at(5, WAIT).await.unwrap();

    b.handle.go_online().await.unwrap();
    assert_converged(&hub, id, &[&a, &b], WAIT).await.unwrap();

    let snapshot = hub.snapshot(id).await.unwrap();
    assert_eq!(snapshot.version, 6);
    assert!(!snapshot.model.task_data[&2].starred);
    assert!(snapshot.model.priority_tasks().is_empty());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_list_moves_resolve_to_one_order() {
    let hub = hub();
    let id = hub.create().await.unwrap();
    for (v, name) in ["Inbox", "Work", "Home"].into_iter().enumerate() {
        hub.dispatch(id, v as u64, add_list(name)).await.unwrap();
    }
    let a = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();
    let b = TestClient::connect(&hub, id, EngineConfig::default())
        .await
        .unwrap();

    a.handle
        .dispatch(TodoAction::MoveList {
            list_id: 2,
            place: ListPlace::Before { anchor: 0 },
        })
        .await
        .unwrap();
    b.handle
        .dispatch(TodoAction::MoveList {
            list_id: 0,
            place: ListPlace::After { anchor: 1 },
        })
        .await
        .unwrap();

    assert_converged(&hub, id, &[&a, &b], WAIT).await.unwrap();
    let snapshot = hub.snapshot(id).await.unwrap();
    let mut lists: Vec<u64> = snapshot.model.lists.iter().copied().collect();
    lists.sort_unstable();
    assert_eq!(lists, vec![0, 1, 2]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_clients_converge_under_contention() {
    let hub = hub();
    let id = seeded(&hub).await;
    let mut clients = Vec::new();
    for _ in 0..4 {
        let client = TestClient::connect(
            &hub,
            id,
            EngineConfig::default().with_tick_interval(Duration::from_millis(20)),
        )
        .await
        .unwrap();
        clients.push(client);
    }

    let mut rng = fastrand::Rng::with_seed(11);
    for round in 0..10 {
        for (i, client) in clients.iter().enumerate() {
            let action = match rng.u8(0..4) {
                0 => add_task(0, &format!("t{i}-{round}")),
                1 => TodoAction::CompleteTask {
                    task_id: rng.u64(0..3),
                },
                2 => TodoAction::MoveTask {
                    task_id: rng.u64(0..3),
                    to_list: 0,
                    place: Place::Before {
                        anchor: rng.u64(0..3),
                    },
                },
                _ => TodoAction::StarTask {
                    task_id: rng.u64(0..3),
                },
            };
            client.handle.dispatch(action).await.unwrap();
        }
        if round == 4 {
            clients[0].handle.go_offline().await.unwrap();
        }
    }
    clients[0].handle.go_online().await.unwrap();

    let refs: Vec<&TestClient<TodoDomain>> = clients.iter().collect();
    assert_converged(&hub, id, &refs, Duration::from_secs(20))
        .await
        .unwrap();

    let audit = hub.audit_log(id).await.unwrap();
    // An action in flight when the session went offline is sent again.
    assert!(audit.len() >= 4 + 40);

    for client in clients {
        client.shutdown().await.unwrap();
    }
}
