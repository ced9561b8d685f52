//! Connection and message rate limits.
//!
//! - [`ConnectionLimiter`]: concurrent connections per IP and per user,
//!   released by dropping the returned [`ConnectionPermit`].
//! - [`MessageRateLimiter`]: token bucket per connection for inbound messages.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;

use crate::config::RateLimitConfig;
use crate::protocol::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("too many connections from {ip} (limit {limit})")]
    TooManyFromIp { ip: IpAddr, limit: usize },
    #[error("too many connections for user {user_id} (limit {limit})")]
    TooManyForUser { user_id: String, limit: usize },
}

impl LimitError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::RateLimitExceeded
    }
}

#[derive(Default)]
struct Counts {
    per_ip: HashMap<IpAddr, usize>,
    per_user: HashMap<String, usize>,
}

/// Tracks live connections per IP and per user.
pub struct ConnectionLimiter {
    counts: Mutex<Counts>,
    max_per_ip: usize,
    max_per_user: usize,
}

enum PermitKey {
    Ip(IpAddr),
    User(String),
}

/// Held for the lifetime of a connection; releases its slot on drop.
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
    key: PermitKey,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut counts = self.limiter.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match &self.key {
            PermitKey::Ip(ip) => release(&mut counts.per_ip, ip),
            PermitKey::User(user_id) => release(&mut counts.per_user, user_id),
        }
    }
}

fn release<K: std::hash::Hash + Eq>(map: &mut HashMap<K, usize>, key: &K) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

impl ConnectionLimiter {
    /// Limits of 0 mean unlimited.
    pub fn new(max_per_ip: usize, max_per_user: usize) -> Self {
        Self {
            counts: Mutex::new(Counts::default()),
            max_per_ip,
            max_per_user,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.connections_per_ip, config.connections_per_user)
    }

    pub fn acquire_ip(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionPermit, LimitError> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.per_ip.entry(ip).or_insert(0);
        if self.max_per_ip > 0 && *count >= self.max_per_ip {
            return Err(LimitError::TooManyFromIp {
                ip,
                limit: self.max_per_ip,
            });
        }
        *count += 1;
        Ok(ConnectionPermit {
            limiter: self.clone(),
            key: PermitKey::Ip(ip),
        })
    }

    pub fn acquire_user(self: &Arc<Self>, user_id: &str) -> Result<ConnectionPermit, LimitError> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.per_user.entry(user_id.to_string()).or_insert(0);
        if self.max_per_user > 0 && *count >= self.max_per_user {
            return Err(LimitError::TooManyForUser {
                user_id: user_id.to_string(),
                limit: self.max_per_user,
            });
        }
        *count += 1;
        Ok(ConnectionPermit {
            limiter: self.clone(),
            key: PermitKey::User(user_id.to_string()),
        })
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.per_ip.get(&ip).copied().unwrap_or(0)
    }

    pub fn connections_for(&self, user_id: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.per_user.get(user_id).copied().unwrap_or(0)
    }
}

/// Verdict for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// Drop the message and tell the client.
    Reject,
    /// Too many consecutive rejections; close the connection.
    Disconnect,
}

/// Token bucket refilled at `rate` tokens per second, bursting up to `rate`.
pub struct MessageRateLimiter {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    strikes: u32,
    max_strikes: u32,
}

impl MessageRateLimiter {
    /// `messages_per_second == 0` disables limiting.
    pub fn new(messages_per_second: u32) -> Self {
        Self {
            rate: messages_per_second as f64,
            tokens: messages_per_second as f64,
            last_refill: Instant::now(),
            strikes: 0,
            max_strikes: messages_per_second.max(1),
        }
    }

    pub fn check(&mut self) -> RateDecision {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> RateDecision {
        if self.rate <= 0.0 {
            return RateDecision::Allow;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.strikes = 0;
            RateDecision::Allow
        } else {
            self.strikes += 1;
            if self.strikes >= self.max_strikes {
                RateDecision::Disconnect
            } else {
                RateDecision::Reject
            }
        }
    }
}
