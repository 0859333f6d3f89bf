//! # Monetary Amounts
//!
//! Quark-precise amounts and their fiat-rate bindings.
//!
//! All on-chain quantities are integers in *quarks*, the smallest
//! indivisible unit of the currency (1 Kin = 100,000 quarks). Fractional
//! quarks can appear transiently when converting from fiat at an exchange
//! rate, but they must never be submitted on-chain: every spend path
//! truncates (or rejects) before issuing a remote call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Number of quarks in one whole Kin.
pub const QUARKS_PER_KIN: u64 = 100_000;

/// A non-negative quantity of Kin, stored in quarks.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Kin {
    quarks: u64,
}

impl Kin {
    pub const ZERO: Kin = Kin { quarks: 0 };

    /// A quantity of whole Kin.
    pub fn from_kin(kin: u64) -> Self {
        Self {
            quarks: kin * QUARKS_PER_KIN,
        }
    }

    pub fn from_quarks(quarks: u64) -> Self {
        Self { quarks }
    }

    pub fn quarks(&self) -> u64 {
        self.quarks
    }

    /// The whole-Kin value, fractional quarks dropped.
    pub fn truncated_kin_value(&self) -> u64 {
        self.quarks / QUARKS_PER_KIN
    }

    /// Quarks in excess of the last whole Kin.
    pub fn fractional_quarks(&self) -> u64 {
        self.quarks % QUARKS_PER_KIN
    }

    pub fn has_whole_kin(&self) -> bool {
        self.truncated_kin_value() > 0
    }

    pub fn is_zero(&self) -> bool {
        self.quarks == 0
    }

    /// A copy with fractional quarks dropped. On-chain operations only
    /// ever see truncated amounts.
    pub fn truncating(&self) -> Kin {
        Kin::from_kin(self.truncated_kin_value())
    }

    pub fn saturating_sub(&self, other: Kin) -> Kin {
        Kin {
            quarks: self.quarks.saturating_sub(other.quarks),
        }
    }
}

impl Add for Kin {
    type Output = Kin;

    fn add(self, rhs: Kin) -> Kin {
        Kin {
            quarks: self.quarks + rhs.quarks,
        }
    }
}

impl Sub for Kin {
    type Output = Kin;

    fn sub(self, rhs: Kin) -> Kin {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for Kin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "K {} ({})", self.truncated_kin_value(), self.fractional_quarks())
    }
}

/// An ISO-4217-style currency code, uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Validates a 3-letter alphabetic code; normalizes to uppercase.
    pub fn new(code: &str) -> Option<Self> {
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Some(Self(code.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn kin() -> Self {
        Self("KIN".to_string())
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An exchange rate binding a fiat currency to Kin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    /// Fiat units per one Kin.
    pub fx: f64,
    pub currency: CurrencyCode,
}

impl Rate {
    /// The identity rate, used for internal Kin-denominated transfers.
    pub fn one_to_one() -> Self {
        Self {
            fx: 1.0,
            currency: CurrencyCode::kin(),
        }
    }
}

/// A Kin quantity bound to the exchange rate it was priced at.
///
/// The fiat value is display-only; the quark quantity is authoritative
/// for every on-chain operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinAmount {
    pub kin: Kin,
    pub rate: Rate,
}

impl KinAmount {
    pub fn new(kin: Kin, rate: Rate) -> Self {
        Self { kin, rate }
    }

    /// A Kin-denominated amount at the identity rate.
    pub fn from_kin(kin: Kin) -> Self {
        Self {
            kin,
            rate: Rate::one_to_one(),
        }
    }

    /// Converts a fiat value into Kin at the given rate. The resulting
    /// quark quantity may carry a fractional-Kin component; spend paths
    /// are responsible for truncating or rejecting it.
    pub fn from_fiat(fiat: f64, rate: Rate) -> Option<Self> {
        if fiat < 0.0 || rate.fx <= 0.0 {
            return None;
        }
        let quarks = (fiat / rate.fx * QUARKS_PER_KIN as f64) as u64;
        Some(Self {
            kin: Kin::from_quarks(quarks),
            rate,
        })
    }

    /// The fiat value at the bound rate.
    pub fn fiat_value(&self) -> f64 {
        self.kin.quarks() as f64 / QUARKS_PER_KIN as f64 * self.rate.fx
    }

    /// A copy with fractional quarks dropped.
    pub fn truncating_quarks(&self) -> KinAmount {
        Self {
            kin: self.kin.truncating(),
            rate: self.rate.clone(),
        }
    }
}
