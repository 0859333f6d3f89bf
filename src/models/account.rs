//! # Sub-Account State
//!
//! Server-reported state for every sub-account in the tray: balance,
//! management (lock) state, on-chain existence, and claim state for
//! ephemeral gift-card accounts.
//!
//! Funds are only ever considered spendable from accounts in the `Locked`
//! management state. An account that is managed but not locked must
//! trigger a migration path, never a direct spend.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use super::amount::{Kin, KinAmount};

/// The role a sub-account plays in the tray.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccountType {
    /// The primary vault. Deposits land here; withdrawals originate here.
    Primary,
    /// The rotating temporary account that receives incoming payments,
    /// identified by its derivation index.
    Incoming,
    /// The optional swap/deposit conversion account.
    Swap,
    /// A denomination slot, the only accounts a payment may be directly
    /// funded from.
    Slot(SlotType),
    /// A per-counterparty account holding funds received privately from
    /// one specific domain.
    Relationship(String),
    /// An ephemeral gift-card account funded for off-band transfer.
    RemoteSend,
}

/// Slot denominations, smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotType {
    Bucket1,
    Bucket10,
    Bucket100,
    Bucket1k,
    Bucket10k,
    Bucket100k,
    Bucket1m,
}

impl SlotType {
    pub const ALL: [SlotType; 7] = [
        SlotType::Bucket1,
        SlotType::Bucket10,
        SlotType::Bucket100,
        SlotType::Bucket1k,
        SlotType::Bucket10k,
        SlotType::Bucket100k,
        SlotType::Bucket1m,
    ];

    /// The denomination value in whole Kin.
    pub fn bill_value(&self) -> u64 {
        match self {
            SlotType::Bucket1 => 1,
            SlotType::Bucket10 => 10,
            SlotType::Bucket100 => 100,
            SlotType::Bucket1k => 1_000,
            SlotType::Bucket10k => 10_000,
            SlotType::Bucket100k => 100_000,
            SlotType::Bucket1m => 1_000_000,
        }
    }

    pub fn derivation_tag(&self) -> &'static str {
        match self {
            SlotType::Bucket1 => "bucket-1",
            SlotType::Bucket10 => "bucket-10",
            SlotType::Bucket100 => "bucket-100",
            SlotType::Bucket1k => "bucket-1k",
            SlotType::Bucket10k => "bucket-10k",
            SlotType::Bucket100k => "bucket-100k",
            SlotType::Bucket1m => "bucket-1m",
        }
    }
}

/// The server's ability to manage funds for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementState {
    /// The state could not be reliably determined.
    Unknown,
    /// The account is not managed; funds never move through it on the
    /// user's behalf.
    None,
    /// Transitioning to `Locked`.
    Locking,
    /// Funds are locked and co-signable. The only spendable state.
    Locked,
    /// Transitioning to `Unlocked`.
    Unlocking,
    /// Co-signing authority has been released. The account must be
    /// migrated back to `Locked` before funds can move again.
    Unlocked,
    /// Transitioning to `Closed`.
    Closing,
    /// Closed on-chain; balance is necessarily zero.
    Closed,
}

impl ManagementState {
    /// Whether funds in this state may be spent directly. Unmanaged
    /// accounts are always usable; managed accounts only when locked.
    pub fn is_spendable(&self) -> bool {
        matches!(self, ManagementState::None | ManagementState::Locked)
    }
}

/// On-chain existence of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockchainState {
    Unknown,
    DoesNotExist,
    Exists,
}

/// Claim state for ephemeral accounts (gift cards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    /// Could not be fetched from the server.
    Unknown,
    /// Not yet claimed; a claim will succeed.
    NotClaimed,
    /// Already claimed; any further claim fails.
    Claimed,
    /// Expired unclaimed; funds return to the issuer.
    Expired,
}

/// A relationship with a third-party counterparty domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub domain: String,
}

/// Server-reported state for one sub-account.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    /// Derivation index for indexed account types; zero otherwise.
    pub index: u64,

    pub account_type: AccountType,

    /// The account's vault address.
    pub address: Pubkey,

    /// Balance in quarks as observed by the server. May be cached and
    /// is only trustworthy while `management_state` is `Locked`.
    pub balance: Kin,

    pub management_state: ManagementState,

    pub blockchain_state: BlockchainState,

    pub claim_state: ClaimState,

    /// For incoming accounts: the server sets this when the client must
    /// actively rotate the account by draining it.
    pub must_rotate: bool,

    /// For gift-card accounts: the exchange data the account was
    /// originally funded with. Absent once stale or never recorded.
    pub original_kin_amount: Option<KinAmount>,

    /// Populated for relationship accounts.
    pub relationship: Option<Relationship>,
}

impl AccountInfo {
    /// An account that is managed but no longer locked cannot be spent
    /// from and must go through migration first.
    pub fn requires_migration(&self) -> bool {
        !matches!(
            self.management_state,
            ManagementState::None | ManagementState::Locked
        )
    }
}
