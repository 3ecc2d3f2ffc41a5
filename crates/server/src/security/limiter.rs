use crate::config::{RateLimitConfig, RateLimitSettings};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    /// `/register`, keyed by source address.
    Register,
    /// `/heartbeat` and `/connection/*`, keyed by client id when the
    /// request carries one, source address otherwise.
    Connection,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

struct WindowState {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) > window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn idle(&self) -> bool {
        self.hits.is_empty() && self.blocked_until.is_none()
    }
}

/// Sliding-window limiter. Exceeding the burst either starts a penalty
/// window or, with a zero penalty, simply waits the window out.
pub struct RateLimiter {
    register: RateLimitSettings,
    connection: RateLimitSettings,
    states: Mutex<HashMap<(RateScope, String), WindowState>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            register: config.register.clone(),
            connection: config.connection.clone(),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn settings(&self, scope: RateScope) -> &RateLimitSettings {
        match scope {
            RateScope::Register => &self.register,
            RateScope::Connection => &self.connection,
        }
    }

    pub async fn check(&self, scope: RateScope, key: &str) -> RateDecision {
        let settings = self.settings(scope).clone();
        let now = Instant::now();
        let mut states = self.states.lock().await;

        // Opportunistically drop idle entries so the map stays bounded
        // by recently active identities.
        states.retain(|(s, _), state| {
            state.prune(now, self.settings(*s).window);
            !state.idle()
        });

        let state = states
            .entry((scope, key.to_string()))
            .or_insert_with(|| WindowState {
                hits: VecDeque::new(),
                blocked_until: None,
            });

        if let Some(until) = state.blocked_until {
            if now < until {
                return RateDecision::deny(until.saturating_duration_since(now));
            }
            state.blocked_until = None;
        }

        if state.hits.len() < settings.burst as usize {
            state.hits.push_back(now);
            return RateDecision::allow();
        }

        if settings.penalty.is_zero() {
            RateDecision::deny(settings.window)
        } else {
            state.blocked_until = Some(now + settings.penalty);
            RateDecision::deny(settings.penalty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn make_config() -> RateLimitConfig {
        let settings = RateLimitSettings {
            burst: 2,
            window: Duration::from_millis(50),
            penalty: Duration::from_millis(80),
        };
        RateLimitConfig {
            register: settings.clone(),
            connection: settings,
        }
    }

    #[tokio::test]
    async fn allows_within_burst() {
        let limiter = RateLimiter::new(&make_config());
        assert!(limiter.check(RateScope::Register, "10.0.0.1").await.allowed);
        assert!(limiter.check(RateScope::Register, "10.0.0.1").await.allowed);
    }

    #[tokio::test]
    async fn blocks_and_recovers_after_penalty() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "10.0.0.2";
        assert!(limiter.check(RateScope::Register, identity).await.allowed);
        assert!(limiter.check(RateScope::Register, identity).await.allowed);
        let decision = limiter.check(RateScope::Register, identity).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after.expect("retry") >= Duration::from_millis(70));
        sleep(Duration::from_millis(140)).await;
        assert!(limiter.check(RateScope::Register, identity).await.allowed);
    }

    #[tokio::test]
    async fn scopes_do_not_interfere() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "10.0.0.3";
        assert!(limiter.check(RateScope::Register, identity).await.allowed);
        assert!(limiter.check(RateScope::Register, identity).await.allowed);
        assert!(!limiter.check(RateScope::Register, identity).await.allowed);
        assert!(limiter.check(RateScope::Connection, identity).await.allowed);
    }

    #[tokio::test]
    async fn zero_penalty_reports_window_as_retry() {
        let mut config = make_config();
        config.connection.penalty = Duration::ZERO;
        let limiter = RateLimiter::new(&config);
        let identity = "10.0.0.4";
        for _ in 0..config.connection.burst {
            assert!(limiter.check(RateScope::Connection, identity).await.allowed);
        }
        let decision = limiter.check(RateScope::Connection, identity).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(config.connection.window));
    }
}
