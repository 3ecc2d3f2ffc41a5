use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    sessions_active: AtomicU64,
    registers_total: AtomicU64,
    heartbeats_total: AtomicU64,
    mailboxes_created: AtomicU64,
    messages_appended: AtomicU64,
    messages_fanned_out: AtomicU64,
    subscribers_active: AtomicU64,
    slow_consumer_drops: AtomicU64,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
    tokens_claimed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_sessions(&self) {
        self.sessions_active.fetch_add(1, Ordering::SeqCst);
        self.registers_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_sessions(&self, count: u64) {
        let mut current = self.sessions_active.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(count);
            match self.sessions_active.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn mark_heartbeat(&self) {
        self.heartbeats_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_mailbox_created(&self) {
        self.mailboxes_created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_append(&self) {
        self.messages_appended.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_fanout(&self, receivers: u64) {
        if receivers == 0 {
            return;
        }
        self.messages_fanned_out
            .fetch_add(receivers, Ordering::SeqCst);
    }

    pub fn incr_subscribers(&self) {
        self.subscribers_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_subscribers(&self) {
        let mut current = self.subscribers_active.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(1);
            match self.subscribers_active.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn mark_slow_consumer(&self) {
        self.slow_consumer_drops.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_token_claimed(&self) {
        self.tokens_claimed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE paircast_sessions_active gauge\npaircast_sessions_active {}\n# TYPE paircast_registers_total counter\npaircast_registers_total {}\n# TYPE paircast_heartbeats_total counter\npaircast_heartbeats_total {}\n# TYPE paircast_mailboxes_created_total counter\npaircast_mailboxes_created_total {}\n# TYPE paircast_messages_appended_total counter\npaircast_messages_appended_total {}\n# TYPE paircast_messages_fanned_out_total counter\npaircast_messages_fanned_out_total {}\n# TYPE paircast_subscribers_active gauge\npaircast_subscribers_active {}\n# TYPE paircast_slow_consumer_drops_total counter\npaircast_slow_consumer_drops_total {}\n# TYPE paircast_rate_limited_total counter\npaircast_rate_limited_total {}\n# TYPE paircast_auth_failures_total counter\npaircast_auth_failures_total {}\n# TYPE paircast_tokens_claimed_total counter\npaircast_tokens_claimed_total {}\n",
            self.sessions_active.load(Ordering::SeqCst),
            self.registers_total.load(Ordering::SeqCst),
            self.heartbeats_total.load(Ordering::SeqCst),
            self.mailboxes_created.load(Ordering::SeqCst),
            self.messages_appended.load(Ordering::SeqCst),
            self.messages_fanned_out.load(Ordering::SeqCst),
            self.subscribers_active.load(Ordering::SeqCst),
            self.slow_consumer_drops.load(Ordering::SeqCst),
            self.rate_limited.load(Ordering::SeqCst),
            self.auth_failures.load(Ordering::SeqCst),
            self.tokens_claimed.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_never_underflow() {
        let metrics = Metrics::new();
        metrics.decr_sessions(3);
        metrics.decr_subscribers();
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("paircast_sessions_active 0"));
        assert!(encoded.contains("paircast_subscribers_active 0"));
    }

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr_sessions();
        metrics.incr_sessions();
        metrics.decr_sessions(1);
        metrics.mark_fanout(3);
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("paircast_sessions_active 1"));
        assert!(encoded.contains("paircast_registers_total 2"));
        assert!(encoded.contains("paircast_messages_fanned_out_total 3"));
    }
}
