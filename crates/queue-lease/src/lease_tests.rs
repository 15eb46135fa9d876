//! Tests for the lease registry.

use super::*;
use std::time::Duration;

/// A lease whose task runs until it is cancelled or its handle is dropped
fn idle_lease(message_id: &MessageId) -> LeaseHandle {
    let (cancel, mut cancelled) = watch::channel(false);
    let task = tokio::spawn(async move {
        while !*cancelled.borrow_and_update() {
            if cancelled.changed().await.is_err() {
                break;
            }
        }
    });
    LeaseHandle::new(message_id.clone(), cancel, task)
}

async fn wait_until_finished(handle: &LeaseHandle) {
    for _ in 0..100 {
        if handle.is_finished() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("lease task for {} did not finish", handle.message_id());
}

#[tokio::test]
async fn test_register_and_remove() {
    let registry = LeaseRegistry::new();
    let id = MessageId::new();

    assert!(registry.register(id.clone(), idle_lease(&id)).is_none());
    assert!(registry.contains(&id));
    assert_eq!(registry.len(), 1);

    let removed = registry.remove(&id).unwrap();
    assert_eq!(removed.message_id(), &id);
    assert!(!removed.is_cancelled());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_remove_unknown_id_is_noop() {
    let registry = LeaseRegistry::new();
    let id = MessageId::new();
    registry.register(id.clone(), idle_lease(&id));

    assert!(registry.remove(&MessageId::new()).is_none());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_second_remove_returns_none() {
    let registry = LeaseRegistry::new();
    let id = MessageId::new();
    registry.register(id.clone(), idle_lease(&id));

    assert!(registry.remove(&id).is_some());
    assert!(registry.remove(&id).is_none());
}

#[tokio::test]
async fn test_register_replaces_and_cancels_previous() {
    let registry = LeaseRegistry::new();
    let id = MessageId::new();

    registry.register(id.clone(), idle_lease(&id));
    let replaced = registry
        .register(id.clone(), idle_lease(&id))
        .expect("first lease should be returned");

    assert!(replaced.is_cancelled());
    assert_eq!(registry.len(), 1);

    let current = registry.remove(&id).unwrap();
    assert!(!current.is_cancelled());
    wait_until_finished(&replaced).await;
}

#[tokio::test]
async fn test_cancel_all_drains_registry() {
    let registry = LeaseRegistry::new();
    let ids: Vec<MessageId> = (0..3).map(|_| MessageId::new()).collect();
    for id in &ids {
        registry.register(id.clone(), idle_lease(id));
    }

    assert_eq!(registry.cancel_all(), 3);
    assert!(registry.is_empty());
    assert_eq!(registry.cancel_all(), 0);
}

#[tokio::test]
async fn test_cancel_stops_task() {
    let id = MessageId::new();
    let handle = idle_lease(&id);

    handle.cancel();

    assert!(handle.is_cancelled());
    wait_until_finished(&handle).await;
}

#[tokio::test]
async fn test_concurrent_register_and_remove() {
    let registry = std::sync::Arc::new(LeaseRegistry::new());
    let ids: Vec<MessageId> = (0..50).map(|_| MessageId::new()).collect();

    let mut tasks = Vec::new();
    for id in ids.clone() {
        let registry = std::sync::Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.register(id.clone(), idle_lease(&id));
            if let Some(handle) = registry.remove(&id) {
                handle.cancel();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(registry.is_empty());
}
