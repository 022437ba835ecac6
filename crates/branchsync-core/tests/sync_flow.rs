//! End-to-end sync flows through the coordinator
//!
//! Two devices, each with its own repository and coordinator, exchange
//! payloads over loopback transports; the tests verify implicit import
//! on receive, convergence after syncing both ways, and that the
//! coordinator state is quiescent after every terminal event.

use std::sync::Arc;
use std::time::Duration;

use branchsync_core::{
    BleConfig, BleTransport, ConversationRepository, CoordinatorEvent, CoordinatorState,
    LoopbackLink, Message, ReceiveOptions, SendOptions, Storage, SyncCoordinator,
};
use tempfile::TempDir;

fn device() -> (TempDir, SyncCoordinator) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path().join("device.redb")).unwrap();
    let repo = ConversationRepository::new(storage);
    (dir, SyncCoordinator::new(repo))
}

fn ble(link: LoopbackLink) -> Arc<BleTransport> {
    Arc::new(
        BleTransport::new(BleConfig {
            chunk_size: 96,
            write_delay: Duration::from_millis(1),
            max_chunks: 65536,
        })
        .with_link(Arc::new(link)),
    )
}

fn seed_conversation(repo: &ConversationRepository, topic: &str, turns: usize) {
    let idea = repo.create_idea(topic, "").unwrap();
    let branch = repo.create_branch("main", &idea.id, None).unwrap();
    for turn in 0..turns {
        repo.create_bind(
            &branch.id,
            Message::user(format!("{topic} question {turn}")),
            Message::assistant(format!("{topic} answer {turn}")),
        )
        .unwrap();
    }
}

/// Run one sync pass from `from` to `to` over a fresh loopback pair
/// and wait for the import to land.
async fn sync_once(from: &SyncCoordinator, to: &SyncCoordinator) {
    let (link_tx, link_rx) = LoopbackLink::pair();
    let mut events = to.subscribe();

    to.start_receiving(ble(link_rx), ReceiveOptions::default())
        .await
        .unwrap();
    from.start_sending(ble(link_tx), SendOptions::default())
        .await
        .unwrap();

    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for import")
            .unwrap()
        {
            CoordinatorEvent::Imported { .. } => break,
            CoordinatorEvent::ReceiveFailed { message, .. } => panic!("receive failed: {message}"),
            _ => {}
        }
    }
    from.stop_sending().await;
    to.stop_receiving().await;
}

#[tokio::test]
async fn devices_converge_after_syncing_both_ways() {
    let (_dir_a, device_a) = device();
    let (_dir_b, device_b) = device();

    seed_conversation(device_a.repository(), "alpha", 3);
    seed_conversation(device_b.repository(), "beta", 2);

    sync_once(&device_a, &device_b).await;
    sync_once(&device_b, &device_a).await;

    // Both devices now hold both conversations
    for coordinator in [&device_a, &device_b] {
        let repo = coordinator.repository();
        let mut idea_names: Vec<String> =
            repo.ideas().unwrap().into_iter().map(|i| i.name).collect();
        idea_names.sort();
        assert_eq!(idea_names, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(repo.branches().unwrap().len(), 2);
    }

    // Message counts match exactly: 3 turns + 2 turns, two messages each
    let total = |coordinator: &SyncCoordinator| -> usize {
        let repo = coordinator.repository();
        repo.branches()
            .unwrap()
            .iter()
            .map(|b| repo.branch_messages(&b.id).unwrap().len())
            .sum()
    };
    assert_eq!(total(&device_a), 10);
    assert_eq!(total(&device_b), 10);
}

#[tokio::test]
async fn repeated_sync_is_stable() {
    let (_dir_a, device_a) = device();
    let (_dir_b, device_b) = device();
    seed_conversation(device_a.repository(), "gamma", 2);

    sync_once(&device_a, &device_b).await;
    let after_first: usize = device_b.repository().branches().unwrap().len();

    // Re-syncing the same content adds nothing
    sync_once(&device_a, &device_b).await;
    assert_eq!(device_b.repository().branches().unwrap().len(), after_first);
    let branches = device_b.repository().branches().unwrap();
    let branch = &branches[0];
    assert_eq!(
        device_b
            .repository()
            .branch_messages(&branch.id)
            .unwrap()
            .len(),
        4
    );
}

#[tokio::test]
async fn coordinator_state_resets_after_failure() {
    let (_dir, coordinator) = device();

    // The counterpart vanishes immediately: receive fails
    let (link, counterpart) = LoopbackLink::pair();
    let mut events = coordinator.subscribe();
    coordinator
        .start_receiving(ble(link), ReceiveOptions::default())
        .await
        .unwrap();
    assert!(coordinator.is_receiving());
    drop(counterpart);

    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for failure")
            .unwrap()
        {
            CoordinatorEvent::ReceiveFailed { .. } => break,
            CoordinatorEvent::Imported { .. } => panic!("unexpected import"),
            _ => {}
        }
    }

    // After the terminal error the caller can immediately retry
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.state(), CoordinatorState::default());

    let (link_a, link_b) = LoopbackLink::pair();
    let _hold = link_b;
    coordinator
        .start_receiving(ble(link_a), ReceiveOptions::default())
        .await
        .unwrap();
    assert!(coordinator.is_receiving());
    coordinator.stop_receiving().await;
    assert!(!coordinator.is_receiving());
}
