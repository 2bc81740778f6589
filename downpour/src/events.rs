//! Download event surface.
//!
//! The orchestrator publishes lifecycle and progress events onto plain mpsc
//! channels; UI or automation collaborators subscribe by consuming their
//! receiver. Ordering is preserved per subscriber and the engine never
//! blocks on a slow or dropped consumer.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};

use parking_lot::Mutex;

use crate::error::ErrorKind;

/// Events raised over the lifetime of one download.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// The download has been accepted and probing/piece creation started.
    Started { id: String },
    /// Aggregate byte progress. `total` is `None` while the overall size is
    /// still unresolved (common for adaptive streams).
    Progress {
        id: String,
        downloaded: u64,
        total: Option<u64>,
    },
    /// The download failed with a classified error.
    Failed { id: String, kind: ErrorKind },
    /// The download was stopped by the user.
    Cancelled { id: String },
    /// All pieces finished and finalization completed.
    Finished { id: String, target: PathBuf },
}

/// Fan-out publisher for [`DownloadEvent`]s.
///
/// Disconnected subscribers are dropped on the next publish.
#[derive(Default)]
pub struct EventPublisher {
    subscribers: Mutex<Vec<Sender<DownloadEvent>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> Receiver<DownloadEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: DownloadEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let publisher = EventPublisher::new();
        let rx1 = publisher.subscribe();
        let rx2 = publisher.subscribe();

        publisher.publish(DownloadEvent::Started { id: "d1".into() });

        assert!(matches!(rx1.try_recv().unwrap(), DownloadEvent::Started { .. }));
        assert!(matches!(rx2.try_recv().unwrap(), DownloadEvent::Started { .. }));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let publisher = EventPublisher::new();
        let rx = publisher.subscribe();
        drop(rx);

        publisher.publish(DownloadEvent::Cancelled { id: "d1".into() });
        assert!(publisher.subscribers.lock().is_empty());
    }

    #[test]
    fn test_events_arrive_in_order() {
        let publisher = EventPublisher::new();
        let rx = publisher.subscribe();

        publisher.publish(DownloadEvent::Started { id: "d1".into() });
        publisher.publish(DownloadEvent::Progress {
            id: "d1".into(),
            downloaded: 10,
            total: Some(100),
        });

        assert!(matches!(rx.recv().unwrap(), DownloadEvent::Started { .. }));
        assert!(matches!(rx.recv().unwrap(), DownloadEvent::Progress { downloaded: 10, .. }));
    }
}
