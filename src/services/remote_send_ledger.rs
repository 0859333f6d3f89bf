//! # Remote-Send Ledger
//!
//! Tracks gift cards issued by this wallet that have not yet been
//! claimed, voided, or expired. Records are keyed by the card's vault
//! address and never carry key material, so the ledger is safe to
//! persist as-is.
//!
//! The ledger is bookkeeping only. Claim state lives server-side; a
//! record here means "we funded this card and have not yet observed a
//! terminal outcome for it".

use std::collections::HashMap;

use solana_sdk::pubkey::Pubkey;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{GiftCardAccount, GiftCardRecord};

/// In-memory ledger of outstanding gift cards.
#[derive(Default)]
pub struct RemoteSendLedger {
    records: RwLock<HashMap<Pubkey, GiftCardRecord>>,
}

impl RemoteSendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly funded card.
    pub async fn insert(&self, card: &GiftCardAccount) {
        let record = card.record();
        debug!(vault = %record.vault, "recording outstanding gift card");
        self.records.write().await.insert(record.vault, record);
    }

    /// Remove a card that reached a terminal state (claimed, voided, or
    /// expired). Returns the record if it was still outstanding.
    pub async fn remove(&self, vault: &Pubkey) -> Option<GiftCardRecord> {
        let removed = self.records.write().await.remove(vault);
        if removed.is_some() {
            debug!(vault = %vault, "gift card settled");
        }
        removed
    }

    pub async fn lookup(&self, vault: &Pubkey) -> Option<GiftCardRecord> {
        self.records.read().await.get(vault).cloned()
    }

    /// All outstanding records, e.g. for persistence or expiry sweeps.
    pub async fn outstanding(&self) -> Vec<GiftCardRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
