use std::sync::Arc;

use courier_core::bus::{EventBus, Subscription};
use courier_core::filter::RecipientFilter;

use crate::socket::{ClientRegistry, Room};

/// The socket adapter's single process-wide bus subscription: every event is
/// re-emitted to the rooms it targets. SSE connections subscribe to the bus
/// per connection instead; both views are fed by the same publish.
pub fn start(
    registry: Arc<ClientRegistry>,
    bus: &Arc<EventBus>,
) -> (Subscription, tokio::task::JoinHandle<()>) {
    let (subscription, mut rx) = bus.subscribe(RecipientFilter::ManagerBroadcast);

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let targets = Room::targets(&event);
            registry.deliver(&targets, &event);
        }
        tracing::info!("event bridge channel closed");
    });

    (subscription, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::events::{ChatEvent, EventKind};
    use courier_core::ids::{ConversationId, EventId, UserId};
    use serde_json::json;

    fn event(id: i64, user: Option<i64>, email: Option<&str>) -> ChatEvent {
        ChatEvent {
            id: EventId::new(id),
            kind: EventKind::Notification,
            conversation_id: Some(ConversationId::new(1)),
            recipient_user_id: user.map(UserId::new),
            recipient_email: email.map(str::to_owned),
            payload: json!({}),
            created_at: "2026-02-14T12:00:00+00:00".into(),
        }
    }

    #[tokio::test]
    async fn bridge_forwards_to_matching_rooms() {
        let registry = Arc::new(ClientRegistry::new(32));
        let bus = EventBus::new();

        let (_manager, mut manager_rx) = registry.register(vec![Room::Managers]);
        let (_cust, mut cust_rx) = registry.register(vec![Room::Email("a@b.com".into())]);

        let (_sub, handle) = start(Arc::clone(&registry), &bus);

        bus.publish(&event(1, None, Some("A@B.com")));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(manager_rx.try_recv().unwrap().id, EventId::new(1));
        assert_eq!(cust_rx.try_recv().unwrap().id, EventId::new(1));

        handle.abort();
    }

    #[tokio::test]
    async fn bridge_skips_unrelated_rooms() {
        let registry = Arc::new(ClientRegistry::new(32));
        let bus = EventBus::new();

        let (_other, mut other_rx) = registry.register(vec![Room::User(99)]);

        let (_sub, handle) = start(Arc::clone(&registry), &bus);

        bus.publish(&event(1, Some(7), None));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(other_rx.try_recv().is_err());

        handle.abort();
    }

    #[tokio::test]
    async fn dropping_subscription_stops_the_bridge() {
        let registry = Arc::new(ClientRegistry::new(32));
        let bus = EventBus::new();

        let (_manager, mut manager_rx) = registry.register(vec![Room::Managers]);
        let (subscription, handle) = start(Arc::clone(&registry), &bus);

        drop(subscription);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        bus.publish(&event(1, None, None));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(manager_rx.try_recv().is_err());
        assert!(handle.is_finished());
    }
}
