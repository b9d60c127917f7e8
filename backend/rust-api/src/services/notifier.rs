use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::models::events::SessionEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Per-session fan-out of change events. Publishing never blocks; a slow
/// subscriber sees `Lagged` and is expected to re-read a snapshot.
pub struct ChangeFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<SessionEvent>>>,
    capacity: usize,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        let session_id = event.session_id().to_string();
        let Some(sender) = channels.get(&session_id) else {
            return 0;
        };
        match sender.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                // Everyone hung up.
                channels.remove(&session_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(session_id).map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::events::TimeExpired;
    use chrono::Utc;

    fn expired(session_id: &str) -> SessionEvent {
        SessionEvent::TimeExpired(TimeExpired {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            message: "Time limit exceeded".to_string(),
        })
    }

    #[tokio::test]
    async fn events_reach_only_their_session() {
        let feed = ChangeFeed::default();
        let mut first = feed.subscribe("s1");
        let mut second = feed.subscribe("s2");

        assert_eq!(feed.publish(expired("s1")), 1);
        let received = first.recv().await.unwrap();
        assert_eq!(received.session_id(), "s1");
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let feed = ChangeFeed::default();
        assert_eq!(feed.publish(expired("nobody")), 0);
        assert_eq!(feed.subscriber_count("nobody"), 0);
    }

    #[test]
    fn closed_channels_are_pruned() {
        let feed = ChangeFeed::default();
        let receiver = feed.subscribe("s1");
        assert_eq!(feed.subscriber_count("s1"), 1);
        drop(receiver);
        assert_eq!(feed.publish(expired("s1")), 0);
        assert_eq!(feed.subscriber_count("s1"), 0);
    }
}
