//! # Account Tray
//!
//! The set of sub-accounts derived from a single root key, with their
//! locally cached state: balances, lock state, and rotation flags.
//!
//! ## Topology
//!
//! | Role | Count | Purpose |
//! |------|-------|---------|
//! | Primary vault | 1 | deposits land here; withdrawals originate here |
//! | Incoming | 1, rotating | receives payments; drained before it expires |
//! | Swap | 1, optional | holds deposits pending conversion |
//! | Relationship | 0..n | per-counterparty private receipts |
//! | Slots | 7 | denomination buckets; the only directly spendable funds |
//!
//! ## Invariants
//!
//! - `slots_balance = Σ slot balances`
//! - `available_balance = slots + incoming + relationships + deposit`
//!   (the balance shown to the user is a superset of what is immediately
//!   spendable)
//! - `refresh` merges server state into existing records keyed by vault
//!   address, preserving identity; it never replaces the collection and
//!   never derives balances by local arithmetic.
//!
//! No network calls originate here; the tray is a pure local cache.

use std::collections::HashMap;

use serde::Serialize;
use solana_sdk::hash::hashv;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{keypair_from_seed, Keypair};
use solana_sdk::signer::Signer;
use tracing::warn;

use crate::models::{AccountInfo, AccountType, Kin, ManagementState, SlotType};

/// Locally cached state for one sub-account.
#[derive(Debug, Clone)]
pub struct PartialAccount {
    pub vault: Pubkey,
    pub index: u64,
    pub balance: Kin,
    pub management_state: ManagementState,
}

impl PartialAccount {
    fn new(vault: Pubkey, index: u64) -> Self {
        Self {
            vault,
            index,
            balance: Kin::ZERO,
            management_state: ManagementState::Unknown,
        }
    }
}

/// A denomination slot and its cached account state.
#[derive(Debug, Clone)]
pub struct Slot {
    pub slot_type: SlotType,
    pub account: PartialAccount,
}

/// A per-counterparty relationship account.
#[derive(Debug, Clone)]
pub struct RelationshipAccount {
    pub domain: String,
    pub vault: Pubkey,
    pub balance: Kin,
    pub management_state: ManagementState,
}

/// A flat, serializable view of the tray for diagnostics. Attached to
/// withdrawal failure reports for support triage.
#[derive(Debug, Clone, Serialize)]
pub struct TraySnapshot {
    pub primary: u64,
    pub incoming: u64,
    pub incoming_index: u64,
    pub swap: u64,
    pub relationships: Vec<(String, u64)>,
    pub slots: Vec<u64>,
}

/// The owner's sub-accounts and their cached state.
pub struct AccountTray {
    owner: Pubkey,
    derivation_seed: [u8; 32],

    primary: PartialAccount,
    incoming: PartialAccount,
    swap: PartialAccount,
    relationships: HashMap<String, RelationshipAccount>,
    slots: Vec<Slot>,

    /// Set when the server asks the client to actively drain and rotate
    /// the incoming account.
    should_rotate_incoming: bool,
}

impl AccountTray {
    /// Builds the tray for a logged-in identity, deriving every
    /// sub-account address from the owner's root key.
    pub fn new(owner: &Keypair) -> Self {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&owner.to_bytes()[..32]);

        let slots = SlotType::ALL
            .iter()
            .map(|&slot_type| Slot {
                slot_type,
                account: PartialAccount::new(
                    derive_vault(&seed, slot_type.derivation_tag(), 0),
                    0,
                ),
            })
            .collect();

        Self {
            owner: owner.pubkey(),
            derivation_seed: seed,
            primary: PartialAccount::new(derive_vault(&seed, "primary", 0), 0),
            incoming: PartialAccount::new(derive_vault(&seed, "incoming", 0), 0),
            swap: PartialAccount::new(derive_vault(&seed, "swap", 0), 0),
            relationships: HashMap::new(),
            slots,
            should_rotate_incoming: false,
        }
    }

    pub fn owner(&self) -> Pubkey {
        self.owner
    }

    pub fn primary_vault(&self) -> Pubkey {
        self.primary.vault
    }

    pub fn incoming_vault(&self) -> Pubkey {
        self.incoming.vault
    }

    // ==========================================
    // BALANCE QUERIES
    // ==========================================

    /// Total across slot accounts, the immediately spendable balance.
    pub fn slots_balance(&self) -> Kin {
        self.slots
            .iter()
            .fold(Kin::ZERO, |acc, s| acc + s.account.balance)
    }

    pub fn available_incoming_balance(&self) -> Kin {
        self.incoming.balance
    }

    /// Balance sitting in the primary vault, available for deposit into
    /// slots (subject to server limits).
    pub fn available_deposit_balance(&self) -> Kin {
        self.primary.balance
    }

    pub fn available_swap_balance(&self) -> Kin {
        self.swap.balance
    }

    pub fn available_relationship_balance(&self) -> Kin {
        self.relationships
            .values()
            .fold(Kin::ZERO, |acc, r| acc + r.balance)
    }

    /// The balance shown to the user: everything that can be made
    /// spendable, not only what already is.
    pub fn available_balance(&self) -> Kin {
        self.slots_balance()
            + self.available_incoming_balance()
            + self.available_relationship_balance()
            + self.available_deposit_balance()
    }

    /// Relationship accounts sorted descending by balance. Pulling from
    /// the largest first minimizes the number of consolidation calls
    /// needed to satisfy a shortfall.
    pub fn relationships_largest_first(&self) -> Vec<RelationshipAccount> {
        let mut all: Vec<RelationshipAccount> = self.relationships.values().cloned().collect();
        all.sort_by(|a, b| b.balance.cmp(&a.balance).then(a.domain.cmp(&b.domain)));
        all
    }

    pub fn should_rotate_incoming(&self) -> bool {
        self.should_rotate_incoming
    }

    /// Whether any managed account has left the `Locked` state and needs
    /// the migration path before further spends.
    pub fn requires_migration(&self) -> bool {
        let accounts = [&self.primary, &self.incoming, &self.swap];
        accounts
            .into_iter()
            .chain(self.slots.iter().map(|s| &s.account))
            .any(|a| {
                !matches!(
                    a.management_state,
                    ManagementState::Unknown | ManagementState::None | ManagementState::Locked
                )
            })
            || self.relationships.values().any(|r| {
                !matches!(
                    r.management_state,
                    ManagementState::Unknown | ManagementState::None | ManagementState::Locked
                )
            })
    }

    // ==========================================
    // MERGE
    // ==========================================

    /// Merges server-reported state into the existing records.
    ///
    /// Identity is preserved: records are updated in place keyed by
    /// vault address (last-writer-wins per sub-account) so external
    /// references remain valid. An incoming account reported at a newer
    /// derivation index rotates the local record to that index.
    pub fn refresh(&mut self, infos: &HashMap<Pubkey, AccountInfo>) {
        for (vault, info) in infos {
            match &info.account_type {
                AccountType::Primary => {
                    if *vault == self.primary.vault {
                        apply(&mut self.primary, info);
                    } else {
                        warn!(vault = %vault, "primary account mismatch; ignoring");
                    }
                }

                AccountType::Incoming => {
                    if *vault != self.incoming.vault {
                        if info.index <= self.incoming.index {
                            // Stale report for an already-rotated
                            // account; rotation only moves forward.
                            continue;
                        }
                        // The server has rotated past our local index.
                        // Re-derive at the reported index and verify.
                        let derived =
                            derive_vault(&self.derivation_seed, "incoming", info.index);
                        if derived != *vault {
                            warn!(
                                vault = %vault,
                                index = info.index,
                                "indexed incoming account mismatch; ignoring"
                            );
                            continue;
                        }
                        warn!(index = info.index, "rotating incoming account index");
                        self.incoming = PartialAccount::new(derived, info.index);
                    }
                    apply(&mut self.incoming, info);
                    self.should_rotate_incoming = info.must_rotate;
                }

                AccountType::Swap => {
                    apply(&mut self.swap, info);
                }

                AccountType::Slot(slot_type) => {
                    match self.slots.iter_mut().find(|s| s.slot_type == *slot_type) {
                        Some(slot) if slot.account.vault == *vault => {
                            apply(&mut slot.account, info);
                        }
                        Some(_) => {
                            warn!(vault = %vault, ?slot_type, "slot account mismatch; ignoring");
                        }
                        None => {}
                    }
                }

                AccountType::Relationship(domain) => {
                    let entry = self
                        .relationships
                        .entry(domain.clone())
                        .or_insert_with(|| RelationshipAccount {
                            domain: domain.clone(),
                            vault: *vault,
                            balance: Kin::ZERO,
                            management_state: ManagementState::Unknown,
                        });
                    entry.balance = info.balance;
                    entry.management_state = info.management_state;
                }

                // Gift cards are tracked by the remote-send ledger, not
                // the tray.
                AccountType::RemoteSend => {}
            }
        }
    }

    /// Rotates the incoming account to the next derivation index.
    pub fn increment_incoming(&mut self) {
        let next = self.incoming.index + 1;
        self.incoming =
            PartialAccount::new(derive_vault(&self.derivation_seed, "incoming", next), next);
        self.should_rotate_incoming = false;
    }

    pub fn snapshot(&self) -> TraySnapshot {
        TraySnapshot {
            primary: self.primary.balance.quarks(),
            incoming: self.incoming.balance.quarks(),
            incoming_index: self.incoming.index,
            swap: self.swap.balance.quarks(),
            relationships: self
                .relationships_largest_first()
                .into_iter()
                .map(|r| (r.domain, r.balance.quarks()))
                .collect(),
            slots: self.slots.iter().map(|s| s.account.balance.quarks()).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_vault(&self, slot_type: SlotType) -> Pubkey {
        self.slots
            .iter()
            .find(|s| s.slot_type == slot_type)
            .map(|s| s.account.vault)
            .unwrap()
    }
}

fn apply(account: &mut PartialAccount, info: &AccountInfo) {
    account.balance = info.balance;
    account.management_state = info.management_state;
}

/// Derives a sub-account vault address from the owner's seed and a role
/// tag. The hash output is a full 32-byte seed, so key construction
/// cannot fail.
fn derive_vault(seed: &[u8; 32], tag: &str, index: u64) -> Pubkey {
    let index_bytes = index.to_le_bytes();
    let digest = hashv(&[seed.as_slice(), tag.as_bytes(), index_bytes.as_slice()]);
    keypair_from_seed(digest.as_ref())
        .expect("32-byte seed")
        .pubkey()
}
