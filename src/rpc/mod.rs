//! # RPC Boundary
//!
//! The abstract async boundary between the engine and the payments
//! server. The wire encoding, signing scheme, and transport all live
//! behind this trait; the engine only decides *what* operations to issue
//! and in what sequence.
//!
//! ## Semantics the engine relies on
//!
//! - `transfer` does not perform consolidation; the caller must have
//!   already guaranteed sufficient slot balance.
//! - The `receive_from_*` calls are consolidation primitives that move
//!   funds into slot accounts; each is independently safe to apply, so a
//!   partially completed consolidation is retained on failure.
//! - `receive_remotely` is self-checking: the server rejects claims on a
//!   card whose claim state is terminal, which is the authoritative guard
//!   against double-claim races.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{
    AccountInfo, AirdropType, GiftCardAccount, Kin, KinAmount, Limits, PaymentMetadata,
    UpgradeableIntent,
};

/// Typed outcomes of a remote call. Callers branch on these to choose
/// recovery behavior, so they are not collapsed into a generic error.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The requested entity does not exist server-side.
    #[error("not found")]
    NotFound,

    /// The account uses a legacy format and must complete a background
    /// migration before further spends.
    #[error("account requires migration")]
    MigrationRequired,

    /// The server refused the transaction, typically because a spending
    /// limit was reached.
    #[error("transaction denied by server")]
    Denied,

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),
}

/// The payments RPC client consumed by the orchestrator.
///
/// Implementations own key material and signing; the engine passes
/// public keys and amounts only. All methods are suspension points;
/// every piece of orchestration logic between them is synchronous.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Fetch current server-side state for every sub-account owned by
    /// `owner`, keyed by vault address.
    async fn fetch_account_infos(
        &self,
        owner: Pubkey,
    ) -> Result<HashMap<Pubkey, AccountInfo>, RpcError>;

    /// Issue a private transfer out of slot accounts. The caller must
    /// have preflighted sufficient slot balance.
    #[allow(clippy::too_many_arguments)]
    async fn transfer(
        &self,
        amount: KinAmount,
        fee: Kin,
        additional_fees: Vec<Kin>,
        rendezvous: Pubkey,
        destination: Pubkey,
        is_withdrawal: bool,
        tip_account: Option<Pubkey>,
    ) -> Result<(), RpcError>;

    /// Drain the rotating incoming account into slots.
    async fn receive_from_incoming(&self, amount: Kin) -> Result<(), RpcError>;

    /// Pull funds from a relationship account into slots.
    async fn receive_from_relationship(&self, domain: &str, amount: Kin) -> Result<(), RpcError>;

    /// Move funds from the primary vault into slots, subject to the
    /// server-enforced deposit limit.
    async fn receive_from_primary(&self, amount: Kin) -> Result<(), RpcError>;

    /// Issue an on-chain withdrawal from the primary vault.
    async fn withdraw(&self, amount: KinAmount, destination: Pubkey) -> Result<(), RpcError>;

    /// Kick off a conversion of the swap/deposit account balance.
    async fn initiate_swap(&self) -> Result<(), RpcError>;

    /// Request a server-initiated payment into the owner's accounts.
    async fn airdrop(
        &self,
        airdrop_type: AirdropType,
        owner: Pubkey,
    ) -> Result<PaymentMetadata, RpcError>;

    /// Fund a gift-card account from slots.
    async fn send_remotely(
        &self,
        amount: KinAmount,
        rendezvous: Pubkey,
        gift_card: &GiftCardAccount,
    ) -> Result<(), RpcError>;

    /// Claim (or, when `is_voiding`, reclaim) a gift card's balance into
    /// the owner's tray.
    async fn receive_remotely(
        &self,
        amount: Kin,
        gift_card: &GiftCardAccount,
        is_voiding: bool,
    ) -> Result<(), RpcError>;

    /// Fetch the spending limits computed since the given date.
    async fn fetch_transaction_limits(
        &self,
        owner: Pubkey,
        since: DateTime<Utc>,
    ) -> Result<Limits, RpcError>;

    /// List submitted transactions eligible for a privacy upgrade.
    async fn fetch_upgradeable_intents(
        &self,
        owner: Pubkey,
    ) -> Result<Vec<UpgradeableIntent>, RpcError>;

    /// Replay the intent's actions to upgrade it to its fully private
    /// form.
    async fn upgrade_privacy(&self, intent: &UpgradeableIntent) -> Result<(), RpcError>;
}
