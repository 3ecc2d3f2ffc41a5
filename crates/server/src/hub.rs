use crate::metrics::Metrics;
use paircast_proto::{
    MailboxMessage, WS_CLOSE_GOING_AWAY, WS_CLOSE_MAILBOX_CLOSED, WS_CLOSE_SLOW_CONSUMER,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    MailboxClosed,
    SlowConsumer,
    GoingAway,
}

impl CloseReason {
    pub fn ws_code(self) -> u16 {
        match self {
            Self::MailboxClosed => WS_CLOSE_MAILBOX_CLOSED,
            Self::SlowConsumer => WS_CLOSE_SLOW_CONSUMER,
            Self::GoingAway => WS_CLOSE_GOING_AWAY,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::MailboxClosed => "mailbox_closed",
            Self::SlowConsumer => "slow_consumer",
            Self::GoingAway => "going_away",
        }
    }
}

#[derive(Debug)]
pub enum HubError {
    SubscriberLimit,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<MailboxMessage>,
    closer: Option<oneshot::Sender<CloseReason>>,
}

/// One WebSocket's view of a mailbox. The message channel carries
/// fan-out in seq order; the close channel fires at most once with the
/// reason the hub dropped the subscriber.
pub struct Subscription {
    pub id: u64,
    pub messages: mpsc::Receiver<MailboxMessage>,
    pub closed: oneshot::Receiver<CloseReason>,
}

/// In-process fan-out registry: `mailbox_id -> subscribers`. Only soft
/// state lives here; subscribers reconnect after a restart and replay
/// from the store. Fan-out uses `try_send` so a slow reader can never
/// stall the appending writer; the full-channel reader is dropped
/// instead.
pub struct SubscriptionHub {
    channel_capacity: usize,
    max_subscribers: usize,
    metrics: Arc<Metrics>,
    entries: RwLock<HashMap<String, Arc<Mutex<Vec<Subscriber>>>>>,
    next_id: AtomicU64,
}

impl SubscriptionHub {
    pub fn new(channel_capacity: usize, max_subscribers: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            channel_capacity,
            max_subscribers,
            metrics,
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn subscribe(&self, mailbox_id: &str) -> Result<Subscription, HubError> {
        let entry = {
            let mut entries = self.entries.write().await;
            Arc::clone(
                entries
                    .entry(mailbox_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Vec::new()))),
            )
        };
        let mut subscribers = entry.lock().await;
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        if subscribers.len() >= self.max_subscribers {
            return Err(HubError::SubscriberLimit);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (message_tx, message_rx) = mpsc::channel(self.channel_capacity);
        let (close_tx, close_rx) = oneshot::channel();
        subscribers.push(Subscriber {
            id,
            sender: message_tx,
            closer: Some(close_tx),
        });
        self.metrics.incr_subscribers();
        Ok(Subscription {
            id,
            messages: message_rx,
            closed: close_rx,
        })
    }

    pub async fn unsubscribe(&self, mailbox_id: &str, subscriber_id: u64) {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(mailbox_id).map(Arc::clone)
        };
        let Some(entry) = entry else { return };
        let mut subscribers = entry.lock().await;
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != subscriber_id);
        if subscribers.len() < before {
            self.metrics.decr_subscribers();
        }
        if subscribers.is_empty() {
            drop(subscribers);
            let mut entries = self.entries.write().await;
            if let Some(empty) = entries.get(mailbox_id) {
                if empty.try_lock().map(|list| list.is_empty()).unwrap_or(false) {
                    entries.remove(mailbox_id);
                }
            }
        }
    }

    /// Pushes one appended message to every live subscriber. Subscribers
    /// whose channel is full are dropped with `slow_consumer`; they must
    /// resubscribe and replay the missed range from the store.
    pub async fn publish(&self, mailbox_id: &str, message: &MailboxMessage) {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(mailbox_id).map(Arc::clone)
        };
        let Some(entry) = entry else { return };
        let mut subscribers = entry.lock().await;
        let mut delivered: u64 = 0;
        subscribers.retain_mut(|subscriber| match subscriber.sender.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = subscriber.id, "dropping slow subscriber");
                if let Some(closer) = subscriber.closer.take() {
                    let _ = closer.send(CloseReason::SlowConsumer);
                }
                self.metrics.mark_slow_consumer();
                self.metrics.decr_subscribers();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.decr_subscribers();
                false
            }
        });
        self.metrics.mark_fanout(delivered);
    }

    /// Closes every subscriber of one mailbox with the given reason and
    /// forgets the entry. Idempotent.
    pub async fn close_mailbox(&self, mailbox_id: &str, reason: CloseReason) {
        let entry = {
            let mut entries = self.entries.write().await;
            entries.remove(mailbox_id)
        };
        let Some(entry) = entry else { return };
        let mut subscribers = entry.lock().await;
        for subscriber in subscribers.iter_mut() {
            if let Some(closer) = subscriber.closer.take() {
                let _ = closer.send(reason);
            }
            self.metrics.decr_subscribers();
        }
        subscribers.clear();
    }

    /// Shutdown path: close everything with `going_away`.
    pub async fn close_all(&self, reason: CloseReason) {
        let mailboxes = self.active_mailboxes().await;
        for mailbox_id in mailboxes {
            self.close_mailbox(&mailbox_id, reason).await;
        }
    }

    /// Mailboxes that currently have at least one subscriber; the reaper
    /// probes these against the store.
    pub async fn active_mailboxes(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }
}
