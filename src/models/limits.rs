//! # Spending Limits
//!
//! Server-issued spending limits, cached client-side with a staleness
//! window. Stale limits are advisory only: they must never gate a spend
//! decision without a refresh.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::amount::{CurrencyCode, Kin};

/// How long fetched limits remain trustworthy.
pub const LIMITS_STALENESS_MINUTES: i64 = 20;

/// Remaining send limits for one currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SendLimit {
    /// Remaining limit to apply on the next transaction.
    pub next_transaction: f64,
    /// Maximum allowed on a per-transaction basis.
    pub max_per_transaction: f64,
    /// Maximum allowed on a per-day basis.
    pub max_per_day: f64,
}

impl SendLimit {
    pub const ZERO: SendLimit = SendLimit {
        next_transaction: 0.0,
        max_per_transaction: 0.0,
        max_per_day: 0.0,
    };
}

/// Server-issued transaction limits, keyed by currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Date from which the limits are computed.
    pub since: DateTime<Utc>,

    /// When the limits were fetched.
    pub fetched_at: DateTime<Utc>,

    /// Maximum amount the server allows moving from the primary vault
    /// into slots in one consolidation.
    pub max_deposit: Kin,

    send_limits: HashMap<CurrencyCode, SendLimit>,
}

impl Limits {
    pub fn new(
        since: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
        max_deposit: Kin,
        send_limits: HashMap<CurrencyCode, SendLimit>,
    ) -> Self {
        Self {
            since,
            fetched_at,
            max_deposit,
            send_limits,
        }
    }

    /// Stale limits must be refetched before being trusted.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at > Duration::minutes(LIMITS_STALENESS_MINUTES)
    }

    pub fn send_limit_for(&self, currency: &CurrencyCode) -> Option<SendLimit> {
        self.send_limits.get(currency).copied()
    }
}
