use super::*;
use shared::error::ApiError;

fn queued_event() -> ServerEvent {
    ServerEvent::Error(ApiError::validation("queued"))
}

#[tokio::test]
async fn lookup_is_absent_until_registered() {
    let registry = ConnectionRegistry::new();
    assert!(registry.lookup(UserId(1)).await.is_none());

    let (handle, mut peer) = registry.open(UserId(1), 4);
    let id = handle.id;
    assert_eq!(registry.register(handle).await, None);

    let sender = registry.lookup(UserId(1)).await.expect("registered");
    assert_eq!(sender.id, id);
    sender.try_enqueue(queued_event()).expect("enqueue");
    assert_eq!(peer.outbound.recv().await, Some(queued_event()));
}

#[tokio::test]
async fn registering_again_supersedes_and_closes_previous() {
    let registry = ConnectionRegistry::new();
    let (first, mut first_peer) = registry.open(UserId(7), 4);
    let first_id = first.id;
    registry.register(first).await;

    let (second, _second_peer) = registry.open(UserId(7), 4);
    let second_id = second.id;
    assert_eq!(registry.register(second).await, Some(first_id));

    assert_eq!(
        (&mut first_peer.close).await.expect("close signal"),
        CloseReason::Superseded
    );
    assert_eq!(registry.lookup(UserId(7)).await.expect("live").id, second_id);
    assert_eq!(registry.connected_count().await, 1);
}

#[tokio::test]
async fn stale_unregister_is_a_no_op() {
    let registry = ConnectionRegistry::new();
    let (first, _first_peer) = registry.open(UserId(3), 4);
    let first_id = first.id;
    registry.register(first).await;
    let (second, _second_peer) = registry.open(UserId(3), 4);
    let second_id = second.id;
    registry.register(second).await;

    assert!(!registry.unregister(UserId(3), first_id).await);
    assert_eq!(registry.lookup(UserId(3)).await.expect("live").id, second_id);

    assert!(registry.unregister(UserId(3), second_id).await);
    assert!(!registry.unregister(UserId(3), second_id).await);
    assert!(registry.lookup(UserId(3)).await.is_none());
}

#[tokio::test]
async fn evict_removes_connection_and_signals_reason() {
    let registry = ConnectionRegistry::new();
    let (handle, mut peer) = registry.open(UserId(9), 1);
    let id = handle.id;
    registry.register(handle).await;

    assert!(!registry
        .evict(UserId(9), ConnectionId(id.0 + 100), CloseReason::SlowConsumer)
        .await);
    assert!(registry.evict(UserId(9), id, CloseReason::SlowConsumer).await);
    assert_eq!(
        (&mut peer.close).await.expect("close signal"),
        CloseReason::SlowConsumer
    );
    assert!(registry.lookup(UserId(9)).await.is_none());
}

#[tokio::test]
async fn full_queue_reports_full_without_blocking() {
    let registry = ConnectionRegistry::new();
    let (handle, _peer) = registry.open(UserId(2), 1);
    registry.register(handle).await;
    let sender = registry.lookup(UserId(2)).await.expect("live");

    sender.try_enqueue(queued_event()).expect("first fits");
    assert_eq!(sender.try_enqueue(queued_event()), Err(EnqueueError::Full));
}

#[test]
fn close_reasons_map_to_protocol_codes() {
    assert_eq!(CloseReason::Superseded.close_code(), close_code::SUPERSEDED);
    assert_eq!(CloseReason::SlowConsumer.close_code(), close_code::SLOW_CONSUMER);
    assert!(!DisconnectReason::from(CloseReason::Superseded).should_reconnect());
    assert!(DisconnectReason::from(CloseReason::SlowConsumer).should_reconnect());
}
