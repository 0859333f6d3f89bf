//! # Gift-Card Accounts
//!
//! An ephemeral account pre-funded by a sender and redeemable once by any
//! holder of its derived key, used for off-band ("remote send") transfers.
//!
//! Lifecycle: created → funded → (claimed by receiver | voided by sender |
//! expired). Claim state lives server-side and is the authoritative guard
//! against double-claim races.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;

use super::amount::KinAmount;

/// An ephemeral gift-card account held in memory by the party that can
/// act on it. The keypair is the bearer credential: whoever holds it can
/// claim the card's funds.
pub struct GiftCardAccount {
    keypair: Keypair,
    /// The amount the card was funded with at creation time.
    pub amount: KinAmount,
    pub created_at: DateTime<Utc>,
}

impl GiftCardAccount {
    /// Generates a fresh card for the given amount.
    pub fn generate(amount: KinAmount) -> Self {
        Self {
            keypair: Keypair::new(),
            amount,
            created_at: Utc::now(),
        }
    }

    /// Reconstructs a card from its bearer key, e.g. one received
    /// off-band from a sender.
    pub fn from_keypair(keypair: Keypair, amount: KinAmount) -> Self {
        Self {
            keypair,
            amount,
            created_at: Utc::now(),
        }
    }

    /// The card's vault address; the key the ledger stores records under.
    pub fn vault_pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The persistable record for this card.
    pub fn record(&self) -> GiftCardRecord {
        GiftCardRecord {
            vault: self.vault_pubkey(),
            amount: self.amount.clone(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for GiftCardAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GiftCardAccount")
            .field("vault", &self.vault_pubkey())
            .field("amount", &self.amount)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// The serializable record of an outstanding gift card, keyed by the
/// card's vault public key. Never carries key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftCardRecord {
    pub vault: Pubkey,
    pub amount: KinAmount,
    pub created_at: DateTime<Utc>,
}
