use crate::app::AppState;
use crate::hub::CloseReason;
use crate::util::now_epoch_ms;
use paircast_storage::StorageError;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

/// Single background sweep: expired sessions, their solely-owned
/// mailboxes, and hub entries whose mailbox the store no longer knows.
/// Per-entity timers would race the store's own TTLs and die with the
/// process; one task probing authoritative state does not.
pub fn spawn(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(state.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = tick_once(&state).await {
                warn!(error = %err, "reaper sweep failed");
            }
        }
    })
}

async fn tick_once(state: &Arc<AppState>) -> Result<(), StorageError> {
    let now = now_epoch_ms();

    let report = state.store.sweep(now).await?;
    if !report.expired_sessions.is_empty() {
        debug!(count = report.expired_sessions.len(), "evicted idle sessions");
        state
            .metrics
            .decr_sessions(report.expired_sessions.len() as u64);
    }
    for mailbox_id in &report.reaped_mailboxes {
        state
            .hub
            .close_mailbox(mailbox_id, CloseReason::MailboxClosed)
            .await;
        state.mailboxes.forget(mailbox_id).await;
    }

    // Subscribed mailboxes are probed against the store so Redis TTL
    // reaping also reaches their WebSocket peers.
    for mailbox_id in state.hub.active_mailboxes().await {
        match state.store.get_mailbox(&mailbox_id, now).await? {
            None => {
                state
                    .hub
                    .close_mailbox(&mailbox_id, CloseReason::MailboxClosed)
                    .await;
                state.mailboxes.forget(&mailbox_id).await;
            }
            Some(header) => {
                // A mailbox dies with the sessions behind it: the sole
                // owner still waiting for a joiner, or both paired
                // participants. Participants that are not client ids
                // (anonymous joiner references) have no session to
                // probe and keep the mailbox on pure TTL.
                if !header.participants.is_empty()
                    && header
                        .participants
                        .iter()
                        .all(|participant| Uuid::parse_str(participant).is_ok())
                {
                    let mut any_live = false;
                    for participant in &header.participants {
                        if state.store.get_session(participant, now).await?.is_some() {
                            any_live = true;
                            break;
                        }
                    }
                    if !any_live {
                        state.store.delete_mailbox(&mailbox_id).await?;
                        state
                            .hub
                            .close_mailbox(&mailbox_id, CloseReason::MailboxClosed)
                            .await;
                        state.mailboxes.forget(&mailbox_id).await;
                    }
                }
            }
        }
    }
    Ok(())
}
