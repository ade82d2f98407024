// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Object Replication
//!
//! Every test runs a master node and one or more slave nodes in-process on
//! a [`LoopbackNetwork`], so no external services are needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `instance_*` - full-snapshot objects and late subscribers
//! - `delta_*` - delta objects, history replay and obsoletion
//! - `unbuffered_*` / `static_*` - the other change types
//! - `sync_*` - sync targets on the slave side
//! - `map_*` / `unmap_*` - subscription lifecycle
//! - `cache_*` - instance data reuse across mappings

mod common;

use common::{cluster, eventually, shutdown_all, start_faulty_node, start_node, Counter, Scene, Sloppy};
use object_replication::{ChangeType, LoopbackNetwork, ReplicationError, Version};

// =============================================================================
// Instance Objects
// =============================================================================

#[tokio::test]
async fn instance_early_and_late_subscribers_converge() {
    let (_network, master_node, slaves) = cluster(2);
    let master = master_node.register_object(Counter::new(ChangeType::Instance));

    let mut early = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Instance))
        .await
        .unwrap();
    assert_eq!(early.version(), Version::NONE);

    for i in 1..=3u64 {
        master.with_mut(|c| c.add(i));
        assert_eq!(master.commit().await.unwrap(), Version(i as u32));
    }

    let mut late = slaves[1]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Instance))
        .await
        .unwrap();
    // Mapped at the oldest retained version: the state after commit 1.
    assert_eq!(late.version(), Version(1));
    assert_eq!(late.get().value, 1);

    for i in 4..=5u64 {
        master.with_mut(|c| c.add(i));
        master.commit().await.unwrap();
    }

    assert_eq!(early.sync(Version(5)).await.unwrap(), Version(5));
    assert_eq!(late.sync(Version(5)).await.unwrap(), Version(5));
    assert_eq!(early.get().value, 15);
    assert_eq!(late.get().value, 15);
    assert_eq!(master.subscribed_nodes(), 2);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn instance_commit_nb_then_commit_sync() {
    let (_network, master_node, slaves) = cluster(0);
    let master = master_node.register_object(Counter::new(ChangeType::Instance));

    let first = master.commit_nb().unwrap();
    let second = master.commit_nb().unwrap();
    assert_ne!(first, second);
    assert_eq!(master.commit_sync(first).await.unwrap(), Version(1));
    assert_eq!(master.commit_sync(second).await.unwrap(), Version(2));

    // A handle can only be waited on once.
    assert!(matches!(
        master.commit_sync(first).await,
        Err(ReplicationError::InvalidState { .. })
    ));

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn instance_partial_consumption_is_tolerated() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Sloppy { first: 1, second: 2 });
    master.commit().await.unwrap();

    let mut slave = slaves[0]
        .map_object(master.id(), master_node.id(), Version::HEAD, Sloppy::default())
        .await
        .unwrap();
    assert_eq!(slave.get().first, 1);

    master.with_mut(|s| {
        s.first = 10;
        s.second = 20;
    });
    master.commit().await.unwrap();
    assert_eq!(slave.sync(Version(2)).await.unwrap(), Version(2));
    assert_eq!(slave.get().first, 10);
    assert_eq!(slave.get().second, 0);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

// =============================================================================
// Delta Objects
// =============================================================================

#[tokio::test]
async fn delta_replay_starts_with_instance_data() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Scene::new("lobby", 300));

    for name in ["camera", "light", "mesh"] {
        master.with_mut(|s| s.push(name));
        master.commit().await.unwrap();
    }

    let mut slave = slaves[0]
        .map_object(master.id(), master_node.id(), Version(2), Scene::default())
        .await
        .unwrap();
    assert_eq!(slave.version(), Version(2));
    assert_eq!(slave.get().nodes, vec!["camera", "light"]);
    assert_eq!(slave.get().payload.len(), 300);

    assert_eq!(slave.sync(Version(3)).await.unwrap(), Version(3));
    assert_eq!(slave.get().nodes, vec!["camera", "light", "mesh"]);

    master.with_mut(|s| s.push("audio"));
    master.commit().await.unwrap();
    slave.sync(Version(4)).await.unwrap();
    assert_eq!(slave.get(), &*master.lock());

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn delta_slave_mapped_before_first_commit_gets_master_state() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Delta));
    master.with_mut(|c| c.value = 5);

    let mut slave = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Delta))
        .await
        .unwrap();
    assert_eq!(slave.version(), Version::NONE);
    assert_eq!(slave.get().value, 5);

    master.with_mut(|c| c.add(1));
    let v = master.commit().await.unwrap();
    assert_eq!(v, Version(1));
    assert_eq!(slave.sync(v).await.unwrap(), v);
    assert_eq!(slave.get().value, master.lock().value);
    assert_eq!(slave.get().value, 6);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn delta_noop_commit_keeps_version() {
    let (_network, master_node, slaves) = cluster(0);
    let master = master_node.register_object(Counter::new(ChangeType::Delta));

    assert_eq!(master.commit().await.unwrap(), Version::NONE);
    master.with_mut(|c| c.add(3));
    assert_eq!(master.commit().await.unwrap(), Version(1));
    assert_eq!(master.commit().await.unwrap(), Version(1));
    assert_eq!(master.retained_versions(), vec![Version(1)]);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn delta_auto_obsolete_bounds_late_subscribers() {
    let (_network, master_node, slaves) = cluster(2);
    let master = master_node.register_object(Counter::new(ChangeType::Delta));
    for _ in 0..5 {
        master.with_mut(|c| c.add(1));
        master.commit().await.unwrap();
    }

    master.set_auto_obsolete(2);
    assert_eq!(master.retained_versions(), vec![Version(4), Version(5)]);
    assert_eq!(master.oldest_version(), Version(4));

    let oldest = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Delta))
        .await
        .unwrap();
    assert_eq!(oldest.version(), Version(4));
    assert_eq!(oldest.get().value, 4);

    // Requests below the retained range start at the oldest version.
    let clamped = slaves[1]
        .map_object(master.id(), master_node.id(), Version(1), Counter::new(ChangeType::Delta))
        .await
        .unwrap();
    assert_eq!(clamped.version(), Version(4));

    master.with_mut(|c| c.add(1));
    master.commit().await.unwrap();
    assert_eq!(master.retained_versions(), vec![Version(5), Version(6)]);

    master.obsolete(Version(100));
    assert_eq!(master.retained_versions(), vec![Version(6)]);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

// =============================================================================
// Unbuffered and Static Objects
// =============================================================================

#[tokio::test]
async fn unbuffered_snapshot_then_deltas() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Unbuffered));
    for _ in 0..3 {
        master.with_mut(|c| c.add(2));
        master.commit().await.unwrap();
    }
    assert_eq!(master.retained_versions(), vec![Version(3)]);

    let mut slave = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Unbuffered))
        .await
        .unwrap();
    assert_eq!(slave.version(), Version(3));
    assert_eq!(slave.get().value, 6);

    master.with_mut(|c| c.add(5));
    master.commit().await.unwrap();
    assert_eq!(slave.sync(Version::NEXT).await.unwrap(), Version(4));
    assert_eq!(slave.get().value, 11);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn unbuffered_slave_mapped_before_first_commit_gets_master_state() {
    let (_network, master_node, slaves) = cluster(2);
    let master = master_node.register_object(Counter::new(ChangeType::Unbuffered));
    master.with_mut(|c| c.value = 5);

    let mut early = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Unbuffered))
        .await
        .unwrap();
    assert_eq!(early.version(), Version::NONE);
    assert_eq!(early.get().value, 5);

    master.with_mut(|c| c.add(1));
    assert_eq!(master.commit().await.unwrap(), Version(1));

    let mut late = slaves[1]
        .map_object(master.id(), master_node.id(), Version::HEAD, Counter::new(ChangeType::Unbuffered))
        .await
        .unwrap();
    assert_eq!(late.version(), Version(1));

    master.with_mut(|c| c.add(2));
    assert_eq!(master.commit().await.unwrap(), Version(2));
    assert_eq!(early.sync(Version(2)).await.unwrap(), Version(2));
    assert_eq!(late.sync(Version(2)).await.unwrap(), Version(2));
    assert_eq!(early.get().value, 8);
    assert_eq!(late.get().value, 8);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn static_object_maps_once_and_rejects_commit() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Static));
    master.with_mut(|c| c.value = 9);

    assert!(matches!(master.commit_nb(), Err(ReplicationError::IllegalOperation(_))));
    assert!(matches!(master.commit().await, Err(ReplicationError::IllegalOperation(_))));
    assert_eq!(master.version(), Version::FIRST);

    let mut slave = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Static))
        .await
        .unwrap();
    assert_eq!(slave.version(), Version::FIRST);
    assert_eq!(slave.get().value, 9);
    assert_eq!(slave.sync(Version::HEAD).await.unwrap(), Version::FIRST);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

// =============================================================================
// Sync Targets
// =============================================================================

#[tokio::test]
async fn sync_next_and_head() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Instance));
    let mut slave = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Instance))
        .await
        .unwrap();

    // Nothing received yet: HEAD does not block.
    assert_eq!(slave.sync(Version::HEAD).await.unwrap(), Version::NONE);

    for _ in 0..3 {
        master.with_mut(|c| c.add(1));
        master.commit().await.unwrap();
    }

    assert_eq!(slave.sync(Version::NEXT).await.unwrap(), Version(1));
    assert!(eventually(|| slave.head_version() == Version(3)).await);
    assert_eq!(slave.sync(Version::HEAD).await.unwrap(), Version(3));
    assert_eq!(slave.get().value, 3);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn sync_rejects_backwards_and_sentinels() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Instance));
    master.commit().await.unwrap();
    master.commit().await.unwrap();

    let mut slave = slaves[0]
        .map_object(master.id(), master_node.id(), Version::HEAD, Counter::new(ChangeType::Instance))
        .await
        .unwrap();
    assert_eq!(slave.version(), Version(2));

    assert!(matches!(
        slave.sync(Version(1)).await,
        Err(ReplicationError::Protocol { .. })
    ));
    assert!(matches!(
        slave.sync(Version::OLDEST).await,
        Err(ReplicationError::IllegalOperation(_))
    ));
    assert_eq!(slave.version(), Version(2));

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

// =============================================================================
// Subscription Lifecycle
// =============================================================================

#[tokio::test]
async fn map_beyond_head_is_refused() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Instance));
    master.commit().await.unwrap();

    let result = slaves[0]
        .map_object(master.id(), master_node.id(), Version(10), Counter::new(ChangeType::Instance))
        .await;
    assert!(matches!(result, Err(ReplicationError::Protocol { .. })));
    assert_eq!(slaves[0].attached_instances(), 0);
    assert_eq!(master.subscribed_nodes(), 0);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn map_change_type_mismatch_unsubscribes() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Instance));
    master.commit().await.unwrap();

    let result = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Delta))
        .await;
    assert!(matches!(result, Err(ReplicationError::Protocol { .. })));
    assert!(eventually(|| master.subscribed_nodes() == 0).await);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn map_unknown_object_times_out() {
    let network = LoopbackNetwork::new();
    let master_node = start_node(&network, "master", |_| {});
    let slave_node = start_node(&network, "slave", |c| c.sync.map_timeout = "100ms".to_string());

    let result = slave_node
        .map_object(
            object_replication::ObjectId::new_v4(),
            master_node.id(),
            Version::OLDEST,
            Counter::new(ChangeType::Instance),
        )
        .await;
    assert!(matches!(result, Err(ReplicationError::Timeout(_))));

    shutdown_all([&slave_node, &master_node]).await;
}

#[tokio::test]
async fn unmap_releases_node_subscription_last() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Counter::new(ChangeType::Instance));
    master.commit().await.unwrap();

    let first = slaves[0]
        .map_object(master.id(), master_node.id(), Version::HEAD, Counter::new(ChangeType::Instance))
        .await
        .unwrap();
    let mut second = slaves[0]
        .map_object(master.id(), master_node.id(), Version::HEAD, Counter::new(ChangeType::Instance))
        .await
        .unwrap();
    assert_eq!(master.subscribed_nodes(), 1);
    assert_eq!(slaves[0].attached_instances(), 2);

    first.unmap();
    master.with_mut(|c| c.add(1));
    master.commit().await.unwrap();
    assert_eq!(second.sync(Version(2)).await.unwrap(), Version(2));
    assert_eq!(master.subscribed_nodes(), 1);

    drop(second);
    assert!(eventually(|| master.subscribed_nodes() == 0).await);
    assert_eq!(slaves[0].attached_instances(), 0);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

#[tokio::test]
async fn map_second_instance_while_node_subscribed() {
    let (_network, master_node, slaves) = cluster(1);
    let master = master_node.register_object(Scene::new("hall", 100));

    let mut first = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Scene::default())
        .await
        .unwrap();
    for name in ["a", "b"] {
        master.with_mut(|s| s.push(name));
        master.commit().await.unwrap();
    }

    let mut second = slaves[0]
        .map_object(master.id(), master_node.id(), Version::OLDEST, Scene::default())
        .await
        .unwrap();
    master.with_mut(|s| s.push("c"));
    master.commit().await.unwrap();

    first.sync(Version(3)).await.unwrap();
    second.sync(Version(3)).await.unwrap();
    assert_eq!(first.get().nodes, second.get().nodes);
    assert_eq!(second.get().nodes, vec!["a", "b", "c"]);

    shutdown_all(slaves.iter().chain([&master_node])).await;
}

// =============================================================================
// Instance Cache
// =============================================================================

#[tokio::test]
async fn cache_skips_versions_already_received() {
    let network = LoopbackNetwork::new();
    let (master_node, wire) = start_faulty_node(&network, "master");
    let slave_node = start_node(&network, "slave-1", |c| c.instance_cache.enabled = true);

    let master = master_node.register_object(Counter::new(ChangeType::Instance));
    for _ in 0..3 {
        master.with_mut(|c| c.add(1));
        master.commit().await.unwrap();
    }

    let first = slave_node
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Instance))
        .await
        .unwrap();
    assert_eq!(first.version(), Version(1));
    let cache = slave_node.instance_cache().unwrap();
    assert!(eventually(|| cache.cached_range(master.id()) == Some((Version(1), Version(3)))).await);
    first.unmap();
    assert!(eventually(|| master.subscribed_nodes() == 0).await);

    master.with_mut(|c| c.add(1));
    master.commit().await.unwrap();

    let before = wire.sent_to("slave-1");
    let mut second = slave_node
        .map_object(master.id(), master_node.id(), Version::OLDEST, Counter::new(ChangeType::Instance))
        .await
        .unwrap();
    // Only version 4 and the reply crossed the wire.
    assert_eq!(wire.sent_to("slave-1") - before, 2);
    assert_eq!(second.version(), Version(1));
    assert_eq!(second.get().value, 1);

    assert_eq!(second.sync(Version(4)).await.unwrap(), Version(4));
    assert_eq!(second.get().value, 4);

    shutdown_all([&slave_node, &master_node]).await;
}
