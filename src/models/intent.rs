//! # Intents & Payment Metadata
//!
//! Privacy-upgrade intents are fetched, attempted, and discarded per
//! background cycle; they carry no local lifecycle of their own.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use uuid::Uuid;

use super::amount::KinAmount;

/// One ledger action that must be replayed to upgrade an
/// already-submitted transaction to its fully private form.
#[derive(Debug, Clone)]
pub struct PrivateAction {
    pub id: u32,
    pub source: Pubkey,
    pub destination: Option<Pubkey>,
    pub amount: KinAmount,
}

/// An already-submitted transaction eligible for a privacy upgrade,
/// together with the ordered actions to replay.
#[derive(Debug, Clone)]
pub struct UpgradeableIntent {
    pub id: Uuid,
    pub actions: Vec<PrivateAction>,
}

/// Metadata describing a server-initiated payment, e.g. an airdrop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub amount: KinAmount,
}

/// The kind of airdrop being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AirdropType {
    /// The one-time welcome grant for a brand-new account.
    GetFirstKin,
}
