//! # Fund Orchestrator Service
//!
//! The single entry point for every operation that moves value. The
//! orchestrator decides *which* sub-accounts funds flow through and *in
//! what order*, so that externally visible spends always originate from
//! slot accounts and consolidation never leaks linkage between
//! counterparties.
//!
//! ## Preflight Flow
//!
//! Payments may only be funded from slot accounts, so any spend larger
//! than the current slot balance consolidates first:
//!
//! ```text
//! transfer_preflight(amount):
//! 1. slots_balance >= amount?  → done, no network calls
//!               ↓ no
//! 2. Drain the incoming account (only when non-zero)
//!               ↓ still short
//! 3. Pull relationship accounts, largest balance first,
//!    stopping as soon as slots cover the amount
//!               ↓ still short
//! 4. Pull from the primary vault, capped by the server's
//!    deposit limit; refetch limits afterwards
//!               ↓
//! 5. slots_balance >= amount?  → Ok / InsufficientFunds
//! ```
//!
//! After every pull the tray is re-merged from a fresh remote read;
//! balances are never adjusted by local arithmetic. A failed pull aborts
//! the preflight and propagates, retaining the pulls that already
//! landed.
//!
//! ## Withdrawal Flow
//!
//! External withdrawals originate from the primary vault, so the
//! fallback order is inverted: vault first, then relationships, then
//! incoming, then an internal private transfer tops the vault up from
//! slots. On failure the step log and a tray snapshot are emitted for
//! triage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::models::{
    AirdropType, ClaimState, CurrencyCode, GiftCardAccount, Kin, KinAmount, Limits,
    PaymentMetadata, SendLimit,
};
use crate::rpc::{RpcClient, RpcError};
use crate::services::RemoteSendLedger;
use crate::tray::AccountTray;

/// Errors surfaced by orchestrated fund flows.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The requested amount exceeds what the tray can make spendable.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// The amount carries fractional quarks, which must never be
    /// submitted on-chain.
    #[error("amount has a fractional-kin component")]
    InvalidFractionalAmount,

    /// The gift card was already claimed by another party.
    #[error("gift card already claimed")]
    GiftCardClaimed,

    /// The gift card expired unclaimed; its funds returned to the
    /// issuer.
    #[error("gift card expired")]
    GiftCardExpired,

    /// The gift card has no balance to claim.
    #[error("gift card balance not found")]
    GiftCardBalanceNotFound,

    /// An account must complete migration before funds can move.
    #[error("account requires migration")]
    MigrationRequired,

    /// The server refused the transaction, typically a limit breach.
    #[error("transaction denied")]
    TransactionDenied,

    /// An underlying RPC failure with no more specific meaning.
    #[error(transparent)]
    Rpc(RpcError),
}

impl From<RpcError> for FlowError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Denied => FlowError::TransactionDenied,
            RpcError::MigrationRequired => FlowError::MigrationRequired,
            other => FlowError::Rpc(other),
        }
    }
}

/// Result of a balance fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSummary {
    /// Everything the tray can make spendable.
    pub available: Kin,

    /// Set when any managed account has left the `Locked` state; the
    /// shell must run the migration path before further spends.
    pub requires_migration: bool,
}

/// The fund orchestration service.
///
/// ## Usage
///
/// ```rust,ignore
/// let orchestrator = FundOrchestrator::new(rpc, &owner, ledger, config);
///
/// let summary = orchestrator.fetch_balance().await?;
/// orchestrator
///     .transfer(amount, fee, vec![], rendezvous, destination, false, None)
///     .await?;
/// ```
pub struct FundOrchestrator {
    /// Payments RPC client.
    rpc: Arc<dyn RpcClient>,

    /// The owner's public key; all sub-accounts derive from it.
    owner: Pubkey,

    /// Locally cached sub-account state.
    tray: RwLock<AccountTray>,

    /// Outstanding gift cards issued by this wallet.
    ledger: Arc<RemoteSendLedger>,

    /// Cached server-issued limits; refetched when stale.
    limits: RwLock<Option<Limits>>,

    /// Publishes the available balance to the shell after every merge.
    balance_tx: watch::Sender<Kin>,

    /// Last swap-initiation attempt, for the cooldown window.
    last_swap: Mutex<Option<Instant>>,

    config: EngineConfig,
}

impl FundOrchestrator {
    pub fn new(
        rpc: Arc<dyn RpcClient>,
        owner: &Keypair,
        ledger: Arc<RemoteSendLedger>,
        config: EngineConfig,
    ) -> Self {
        let (balance_tx, _) = watch::channel(Kin::ZERO);
        Self {
            rpc,
            owner: owner.pubkey(),
            tray: RwLock::new(AccountTray::new(owner)),
            ledger,
            limits: RwLock::new(None),
            balance_tx,
            last_swap: Mutex::new(None),
            config,
        }
    }

    /// Subscribe to available-balance updates. A new value is published
    /// after every tray merge.
    pub fn subscribe_balance(&self) -> watch::Receiver<Kin> {
        self.balance_tx.subscribe()
    }

    /// The address third parties deposit to (the primary vault).
    pub async fn deposit_address(&self) -> Pubkey {
        self.tray.read().await.primary_vault()
    }

    pub async fn available_balance(&self) -> Kin {
        self.tray.read().await.available_balance()
    }

    pub fn ledger(&self) -> &RemoteSendLedger {
        &self.ledger
    }

    // ==========================================
    // BALANCE
    // ==========================================

    /// Fetch fresh server state, merge it into the tray, and run the
    /// passive maintenance that piggybacks on a balance fetch: rotating
    /// the incoming account when the server requests it and kicking off
    /// a swap conversion when the swap account holds funds.
    ///
    /// Rotation and swap failures are logged, not propagated; the next
    /// fetch retries them.
    pub async fn fetch_balance(&self) -> Result<BalanceSummary, FlowError> {
        self.refresh_tray().await?;

        let (rotate, incoming, requires_migration) = {
            let tray = self.tray.read().await;
            (
                tray.should_rotate_incoming(),
                tray.available_incoming_balance(),
                tray.requires_migration(),
            )
        };

        if rotate && incoming.has_whole_kin() {
            match self.rpc.receive_from_incoming(incoming.truncating()).await {
                Ok(()) => {
                    self.tray.write().await.increment_incoming();
                    self.refresh_tray().await?;
                }
                Err(e) => warn!("Incoming rotation failed: {e}"),
            }
        }

        self.swap_if_needed().await;

        let available = self.available_balance().await;
        self.balance_tx.send_replace(available);
        Ok(BalanceSummary {
            available,
            requires_migration,
        })
    }

    /// Re-fetch all account infos and merge them into the tray.
    async fn refresh_tray(&self) -> Result<(), FlowError> {
        let infos = self.rpc.fetch_account_infos(self.owner).await?;
        let available = {
            let mut tray = self.tray.write().await;
            tray.refresh(&infos);
            tray.available_balance()
        };
        self.balance_tx.send_replace(available);
        Ok(())
    }

    /// Kick off a conversion of the swap account balance, at most once
    /// per cooldown window.
    async fn swap_if_needed(&self) {
        let swap = self.tray.read().await.available_swap_balance();
        if !swap.has_whole_kin() {
            return;
        }

        let cooldown = Duration::from_secs(self.config.swap_cooldown_secs);
        {
            let mut last = self.last_swap.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed() < cooldown {
                    debug!("Swap skipped, still inside cooldown window");
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        info!(balance = %swap, "Initiating swap conversion");
        if let Err(e) = self.rpc.initiate_swap().await {
            warn!("Swap initiation failed: {e}");
        }
    }

    // ==========================================
    // TRANSFERS
    // ==========================================

    /// Ensure slot accounts hold at least `amount`, consolidating from
    /// the incoming account, relationship accounts (largest first), and
    /// finally the primary vault within the server's deposit limit.
    ///
    /// Postcondition on `Ok`: `slots_balance >= amount`.
    pub async fn transfer_preflight(&self, amount: Kin) -> Result<(), FlowError> {
        let (slots, incoming) = {
            let tray = self.tray.read().await;
            (tray.slots_balance(), tray.available_incoming_balance())
        };
        if slots >= amount {
            return Ok(());
        }

        info!(
            slots = %slots,
            needed = %amount,
            "Consolidating funds into slots"
        );

        if incoming.has_whole_kin() {
            debug!(balance = %incoming, "Pulling incoming account");
            self.rpc.receive_from_incoming(incoming.truncating()).await?;
            self.refresh_tray().await?;
            if self.slots_balance().await >= amount {
                return Ok(());
            }
        }

        let relationships = self.tray.read().await.relationships_largest_first();
        for rel in relationships {
            if !rel.balance.has_whole_kin() {
                continue;
            }
            debug!(domain = %rel.domain, balance = %rel.balance, "Pulling relationship account");
            self.rpc
                .receive_from_relationship(&rel.domain, rel.balance.truncating())
                .await?;
            self.refresh_tray().await?;
            if self.slots_balance().await >= amount {
                return Ok(());
            }
        }

        let primary = self.tray.read().await.available_deposit_balance();
        if primary.has_whole_kin() {
            let max_deposit = self.ensure_limits().await?;
            let pull = primary.truncating().min(max_deposit);
            if pull.has_whole_kin() {
                debug!(amount = %pull, "Pulling primary vault within deposit limit");
                self.rpc.receive_from_primary(pull).await?;
                self.refetch_limits().await?;
                self.refresh_tray().await?;
            }
        }

        if self.slots_balance().await >= amount {
            Ok(())
        } else {
            Err(FlowError::InsufficientFunds)
        }
    }

    /// Issue a private transfer to `destination`, consolidating first if
    /// needed. Returns the available balance after the transfer.
    #[allow(clippy::too_many_arguments)]
    pub async fn transfer(
        &self,
        amount: KinAmount,
        fee: Kin,
        additional_fees: Vec<Kin>,
        rendezvous: Pubkey,
        destination: Pubkey,
        is_withdrawal: bool,
        tip_account: Option<Pubkey>,
    ) -> Result<Kin, FlowError> {
        self.validate_spend(amount.kin).await?;
        self.transfer_preflight(amount.kin).await?;

        self.rpc
            .transfer(
                amount,
                fee,
                additional_fees,
                rendezvous,
                destination,
                is_withdrawal,
                tip_account,
            )
            .await?;

        self.refresh_tray().await?;
        Ok(self.available_balance().await)
    }

    /// Reject spends that cannot possibly succeed before any network
    /// call is made.
    async fn validate_spend(&self, amount: Kin) -> Result<(), FlowError> {
        if amount.fractional_quarks() != 0 {
            return Err(FlowError::InvalidFractionalAmount);
        }
        if amount > self.available_balance().await {
            return Err(FlowError::InsufficientFunds);
        }
        Ok(())
    }

    // ==========================================
    // WITHDRAWALS
    // ==========================================

    /// Withdraw to an external on-chain address.
    ///
    /// Withdrawals originate from the primary vault, so the
    /// consolidation order is the reverse of a payment: the vault's own
    /// balance first, then relationship and incoming pulls into slots,
    /// then an internal transfer topping the vault up from slots.
    pub async fn withdraw_externally(
        &self,
        amount: KinAmount,
        destination: Pubkey,
    ) -> Result<Kin, FlowError> {
        self.validate_spend(amount.kin).await?;

        let mut steps: Vec<String> = Vec::new();
        match self.withdraw_steps(&amount, destination, &mut steps).await {
            Ok(()) => {
                self.refresh_tray().await?;
                Ok(self.available_balance().await)
            }
            Err(e) => {
                let snapshot = self.tray.read().await.snapshot();
                let tray_json = serde_json::to_string(&snapshot)
                    .unwrap_or_else(|_| "<unserializable>".to_string());
                error!(
                    amount = %amount.kin,
                    steps = ?steps,
                    tray = %tray_json,
                    "Withdrawal failed: {e}"
                );
                Err(e)
            }
        }
    }

    async fn withdraw_steps(
        &self,
        amount: &KinAmount,
        destination: Pubkey,
        steps: &mut Vec<String>,
    ) -> Result<(), FlowError> {
        let kin = amount.kin;
        let primary = self.tray.read().await.available_deposit_balance();

        if primary < kin {
            let relationships = self.tray.read().await.relationships_largest_first();
            for rel in relationships {
                if self.withdrawable_balance().await >= kin {
                    break;
                }
                if !rel.balance.has_whole_kin() {
                    continue;
                }
                steps.push(format!("pull relationship {} {}", rel.domain, rel.balance));
                self.rpc
                    .receive_from_relationship(&rel.domain, rel.balance.truncating())
                    .await?;
                self.refresh_tray().await?;
            }

            if self.withdrawable_balance().await < kin {
                let incoming = self.tray.read().await.available_incoming_balance();
                if incoming.has_whole_kin() {
                    steps.push(format!("pull incoming {incoming}"));
                    self.rpc.receive_from_incoming(incoming.truncating()).await?;
                    self.refresh_tray().await?;
                }
            }

            let (primary_now, slots, vault) = {
                let tray = self.tray.read().await;
                (
                    tray.available_deposit_balance(),
                    tray.slots_balance(),
                    tray.primary_vault(),
                )
            };
            let shortfall = kin.saturating_sub(primary_now);
            if !shortfall.is_zero() {
                if slots < shortfall {
                    return Err(FlowError::InsufficientFunds);
                }
                steps.push(format!("internal transfer {shortfall} to vault"));
                let rendezvous = Keypair::new().pubkey();
                self.rpc
                    .transfer(
                        KinAmount::from_kin(shortfall),
                        Kin::ZERO,
                        Vec::new(),
                        rendezvous,
                        vault,
                        true,
                        None,
                    )
                    .await?;
                self.refetch_limits().await?;
                self.refresh_tray().await?;
            }
        }

        steps.push(format!("withdraw {kin}"));
        self.rpc.withdraw(amount.clone(), destination).await?;
        Ok(())
    }

    // ==========================================
    // REMOTE SEND (GIFT CARDS)
    // ==========================================

    /// Fund a gift card from slots. The card is recorded in the ledger
    /// only after the server accepts the funding transaction.
    pub async fn send_remotely(
        &self,
        amount: KinAmount,
        rendezvous: Pubkey,
        gift_card: &GiftCardAccount,
    ) -> Result<Kin, FlowError> {
        self.validate_spend(amount.kin).await?;
        self.transfer_preflight(amount.kin).await?;

        self.rpc.send_remotely(amount, rendezvous, gift_card).await?;
        self.ledger.insert(gift_card).await;

        self.refresh_tray().await?;
        Ok(self.available_balance().await)
    }

    /// Like [`send_remotely`](Self::send_remotely), but bounded by the
    /// bill presentation window: if the card is still outstanding when
    /// the window lapses, it is voided and its funds reclaimed.
    pub async fn send_remotely_timed(
        &self,
        amount: KinAmount,
        rendezvous: Pubkey,
        gift_card: &GiftCardAccount,
    ) -> Result<Kin, FlowError> {
        let kin = amount.kin.truncating();
        let balance = self.send_remotely(amount, rendezvous, gift_card).await?;

        tokio::time::sleep(Duration::from_secs(self.config.bill_timeout_secs)).await;

        if self.ledger.lookup(&gift_card.vault_pubkey()).await.is_some() {
            info!(
                vault = %gift_card.vault_pubkey(),
                "Bill window lapsed, voiding gift card"
            );
            return self.cancel_remote_send(gift_card, kin).await;
        }
        Ok(balance)
    }

    /// Claim a gift card's full balance into this wallet. Returns the
    /// amount the card was originally funded with and the new available
    /// balance.
    pub async fn receive_remote(
        &self,
        gift_card: &GiftCardAccount,
    ) -> Result<(KinAmount, Kin), FlowError> {
        let infos = self
            .rpc
            .fetch_account_infos(gift_card.vault_pubkey())
            .await?;
        let info = infos
            .get(&gift_card.vault_pubkey())
            .ok_or(FlowError::GiftCardBalanceNotFound)?;

        // A card whose original funding amount is no longer recorded is
        // unreadable regardless of its claim state.
        let original = info
            .original_kin_amount
            .clone()
            .ok_or(FlowError::GiftCardBalanceNotFound)?;

        match info.claim_state {
            ClaimState::Claimed => return Err(FlowError::GiftCardClaimed),
            // An unknown claim state is treated as terminal; claiming
            // anyway could double-credit against a racing cancel.
            ClaimState::Expired | ClaimState::Unknown => {
                return Err(FlowError::GiftCardExpired)
            }
            ClaimState::NotClaimed => {}
        }

        let balance = info.balance;
        if balance.is_zero() {
            return Err(FlowError::GiftCardBalanceNotFound);
        }

        self.rpc.receive_remotely(balance, gift_card, false).await?;
        self.ledger.remove(&gift_card.vault_pubkey()).await;

        self.refresh_tray().await?;
        Ok((original, self.available_balance().await))
    }

    /// Void an unclaimed gift card, reclaiming the given amount.
    ///
    /// The sender cannot observe a remote claim locally, so the void may
    /// race one. When the server rejects the void because the card has
    /// already been claimed, the send settled: the record is closed and
    /// the current balance returned instead of an error.
    pub async fn cancel_remote_send(
        &self,
        gift_card: &GiftCardAccount,
        amount: Kin,
    ) -> Result<Kin, FlowError> {
        if let Err(err) = self.rpc.receive_remotely(amount, gift_card, true).await {
            if self.card_settled(gift_card).await {
                info!(
                    vault = %gift_card.vault_pubkey(),
                    "Gift card was claimed before the void; treating as settled"
                );
                self.ledger.remove(&gift_card.vault_pubkey()).await;
                self.refresh_tray().await?;
                return Ok(self.available_balance().await);
            }
            return Err(err.into());
        }
        self.ledger.remove(&gift_card.vault_pubkey()).await;

        self.refresh_tray().await?;
        Ok(self.available_balance().await)
    }

    /// True when the server reports the card's balance as claimed. Used
    /// to disambiguate a rejected void from a transient failure.
    async fn card_settled(&self, gift_card: &GiftCardAccount) -> bool {
        match self.rpc.fetch_account_infos(gift_card.vault_pubkey()).await {
            Ok(infos) => infos
                .get(&gift_card.vault_pubkey())
                .map(|info| info.claim_state == ClaimState::Claimed)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    // ==========================================
    // HOUSEKEEPING
    // ==========================================

    /// Opportunistically pull deposited funds into slots and rotate the
    /// incoming account when the server requires it. Suitable to run on
    /// foregrounding or after an expected deposit.
    pub async fn receive_if_needed(&self) -> Result<Kin, FlowError> {
        self.refresh_tray().await?;

        let primary = self.tray.read().await.available_deposit_balance();
        if primary.has_whole_kin() {
            let max_deposit = self.ensure_limits().await?;
            let pull = primary.truncating().min(max_deposit);
            if pull.has_whole_kin() {
                info!(amount = %pull, "Receiving deposited funds into slots");
                self.rpc.receive_from_primary(pull).await?;
                self.refetch_limits().await?;
                self.refresh_tray().await?;
            }
        }

        let (rotate, incoming) = {
            let tray = self.tray.read().await;
            (
                tray.should_rotate_incoming(),
                tray.available_incoming_balance(),
            )
        };
        if rotate && incoming.has_whole_kin() {
            self.rpc.receive_from_incoming(incoming.truncating()).await?;
            self.tray.write().await.increment_incoming();
            self.refresh_tray().await?;
        }

        Ok(self.available_balance().await)
    }

    /// Request the one-time welcome grant and pull it into slots.
    pub async fn airdrop_first_kin(&self) -> Result<(PaymentMetadata, Kin), FlowError> {
        let metadata = self.rpc.airdrop(AirdropType::GetFirstKin, self.owner).await?;
        info!(amount = %metadata.amount.kin, "Welcome airdrop received");
        let balance = self.receive_if_needed().await?;
        Ok((metadata, balance))
    }

    // ==========================================
    // LIMITS
    // ==========================================

    /// Refetch limits when missing or past the staleness window.
    pub async fn update_limits(&self) -> Result<(), FlowError> {
        if self.are_limits_stale().await {
            self.refetch_limits().await?;
        }
        Ok(())
    }

    pub async fn are_limits_stale(&self) -> bool {
        self.limits
            .read()
            .await
            .as_ref()
            .map_or(true, |l| l.is_stale())
    }

    /// The current vault-to-slots deposit cap. Zero until limits have
    /// been fetched.
    pub async fn max_deposit(&self) -> Kin {
        self.limits
            .read()
            .await
            .as_ref()
            .map_or(Kin::ZERO, |l| l.max_deposit)
    }

    pub async fn send_limit_for(&self, currency: &CurrencyCode) -> Option<SendLimit> {
        self.limits
            .read()
            .await
            .as_ref()
            .and_then(|l| l.send_limit_for(currency))
    }

    /// Fetch limits if missing or stale; returns the deposit cap.
    async fn ensure_limits(&self) -> Result<Kin, FlowError> {
        if self.are_limits_stale().await {
            self.refetch_limits().await?;
        }
        Ok(self.max_deposit().await)
    }

    /// Unconditionally refetch limits, computed from the start of the
    /// current UTC day.
    async fn refetch_limits(&self) -> Result<(), FlowError> {
        let since = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or_else(Utc::now);
        let limits = self.rpc.fetch_transaction_limits(self.owner, since).await?;
        *self.limits.write().await = Some(limits);
        Ok(())
    }

    async fn slots_balance(&self) -> Kin {
        self.tray.read().await.slots_balance()
    }

    async fn withdrawable_balance(&self) -> Kin {
        let tray = self.tray.read().await;
        tray.available_deposit_balance() + tray.slots_balance()
    }

    #[cfg(test)]
    pub(crate) async fn tray(&self) -> tokio::sync::RwLockReadGuard<'_, AccountTray> {
        self.tray.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccountInfo, AccountType, BlockchainState, ManagementState, Relationship, SlotType,
        UpgradeableIntent,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;

    /// A scripted in-memory server. Consolidation calls move balances
    /// between the seeded accounts the way the real server would, so
    /// the post-pull re-fetches observe consistent state.
    struct ScriptedRpc {
        accounts: StdMutex<HashMap<Pubkey, AccountInfo>>,
        max_deposit: StdMutex<Kin>,
        calls: StdMutex<Vec<String>>,
        fail: StdMutex<HashSet<&'static str>>,
    }

    impl ScriptedRpc {
        fn new() -> Self {
            Self {
                accounts: StdMutex::new(HashMap::new()),
                max_deposit: StdMutex::new(Kin::from_kin(1_000_000)),
                calls: StdMutex::new(Vec::new()),
                fail: StdMutex::new(HashSet::new()),
            }
        }

        fn seed(&self, info: AccountInfo) {
            self.accounts.lock().unwrap().insert(info.address, info);
        }

        fn set_max_deposit(&self, kin: Kin) {
            *self.max_deposit.lock().unwrap() = kin;
        }

        fn fail_on(&self, method: &'static str) {
            self.fail.lock().unwrap().insert(method);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn check(&self, method: &'static str) -> Result<(), RpcError> {
            if self.fail.lock().unwrap().contains(method) {
                Err(RpcError::Network(format!("{method} scripted to fail")))
            } else {
                Ok(())
            }
        }

        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn debit(&self, matcher: impl Fn(&AccountInfo) -> bool, amount: Kin) {
            let mut accounts = self.accounts.lock().unwrap();
            if let Some(info) = accounts.values_mut().find(|i| matcher(i)) {
                info.balance = info.balance - amount;
            }
        }

        fn credit_slot(&self, amount: Kin) {
            let mut accounts = self.accounts.lock().unwrap();
            if let Some(info) = accounts
                .values_mut()
                .find(|i| matches!(i.account_type, AccountType::Slot(_)))
            {
                info.balance = info.balance + amount;
            }
        }
    }

    #[async_trait]
    impl RpcClient for ScriptedRpc {
        async fn fetch_account_infos(
            &self,
            _owner: Pubkey,
        ) -> Result<HashMap<Pubkey, AccountInfo>, RpcError> {
            Ok(self.accounts.lock().unwrap().clone())
        }

        async fn transfer(
            &self,
            amount: KinAmount,
            _fee: Kin,
            _additional_fees: Vec<Kin>,
            _rendezvous: Pubkey,
            destination: Pubkey,
            _is_withdrawal: bool,
            _tip_account: Option<Pubkey>,
        ) -> Result<(), RpcError> {
            self.check("transfer")?;
            self.log(format!("transfer:{}", amount.kin.truncated_kin_value()));
            self.debit(
                |i| matches!(i.account_type, AccountType::Slot(_)),
                amount.kin,
            );
            let mut accounts = self.accounts.lock().unwrap();
            if let Some(info) = accounts.get_mut(&destination) {
                info.balance = info.balance + amount.kin;
            }
            Ok(())
        }

        async fn receive_from_incoming(&self, amount: Kin) -> Result<(), RpcError> {
            self.check("receive_from_incoming")?;
            self.log(format!("incoming:{}", amount.truncated_kin_value()));
            self.debit(|i| i.account_type == AccountType::Incoming, amount);
            self.credit_slot(amount);
            Ok(())
        }

        async fn receive_from_relationship(
            &self,
            domain: &str,
            amount: Kin,
        ) -> Result<(), RpcError> {
            self.check("receive_from_relationship")?;
            self.log(format!("rel:{domain}:{}", amount.truncated_kin_value()));
            self.debit(
                |i| i.account_type == AccountType::Relationship(domain.to_string()),
                amount,
            );
            self.credit_slot(amount);
            Ok(())
        }

        async fn receive_from_primary(&self, amount: Kin) -> Result<(), RpcError> {
            self.check("receive_from_primary")?;
            self.log(format!("primary:{}", amount.truncated_kin_value()));
            self.debit(|i| i.account_type == AccountType::Primary, amount);
            self.credit_slot(amount);
            Ok(())
        }

        async fn withdraw(
            &self,
            amount: KinAmount,
            _destination: Pubkey,
        ) -> Result<(), RpcError> {
            self.check("withdraw")?;
            self.log(format!("withdraw:{}", amount.kin.truncated_kin_value()));
            self.debit(|i| i.account_type == AccountType::Primary, amount.kin);
            Ok(())
        }

        async fn initiate_swap(&self) -> Result<(), RpcError> {
            self.check("initiate_swap")?;
            self.log("swap".to_string());
            Ok(())
        }

        async fn airdrop(
            &self,
            _airdrop_type: AirdropType,
            _owner: Pubkey,
        ) -> Result<PaymentMetadata, RpcError> {
            self.log("airdrop".to_string());
            let amount = KinAmount::from_kin(Kin::from_kin(1));
            let mut accounts = self.accounts.lock().unwrap();
            if let Some(info) = accounts
                .values_mut()
                .find(|i| i.account_type == AccountType::Primary)
            {
                info.balance = info.balance + amount.kin;
            }
            Ok(PaymentMetadata { amount })
        }

        async fn send_remotely(
            &self,
            amount: KinAmount,
            _rendezvous: Pubkey,
            _gift_card: &GiftCardAccount,
        ) -> Result<(), RpcError> {
            self.check("send_remotely")?;
            self.log(format!("send_remote:{}", amount.kin.truncated_kin_value()));
            self.debit(
                |i| matches!(i.account_type, AccountType::Slot(_)),
                amount.kin,
            );
            Ok(())
        }

        async fn receive_remotely(
            &self,
            amount: Kin,
            gift_card: &GiftCardAccount,
            is_voiding: bool,
        ) -> Result<(), RpcError> {
            self.check("receive_remotely")?;
            self.log(format!(
                "receive_remote:{}:void={is_voiding}",
                amount.truncated_kin_value()
            ));
            {
                let mut accounts = self.accounts.lock().unwrap();
                if let Some(entry) = accounts.get_mut(&gift_card.vault_pubkey()) {
                    // The server refuses to move a claimed card's funds
                    // a second time, voiding or not.
                    if entry.claim_state == ClaimState::Claimed {
                        return Err(RpcError::Denied);
                    }
                    entry.balance = Kin::ZERO;
                    if !is_voiding {
                        entry.claim_state = ClaimState::Claimed;
                    }
                }
            }
            self.credit_slot(amount);
            Ok(())
        }

        async fn fetch_transaction_limits(
            &self,
            _owner: Pubkey,
            since: DateTime<Utc>,
        ) -> Result<Limits, RpcError> {
            self.log("limits".to_string());
            Ok(Limits::new(
                since,
                Utc::now(),
                *self.max_deposit.lock().unwrap(),
                HashMap::new(),
            ))
        }

        async fn fetch_upgradeable_intents(
            &self,
            _owner: Pubkey,
        ) -> Result<Vec<UpgradeableIntent>, RpcError> {
            Ok(Vec::new())
        }

        async fn upgrade_privacy(&self, _intent: &UpgradeableIntent) -> Result<(), RpcError> {
            Ok(())
        }
    }

    struct Harness {
        rpc: Arc<ScriptedRpc>,
        orchestrator: FundOrchestrator,
    }

    fn info(address: Pubkey, account_type: AccountType, balance: Kin) -> AccountInfo {
        let relationship = match &account_type {
            AccountType::Relationship(domain) => Some(Relationship {
                domain: domain.clone(),
            }),
            _ => None,
        };
        AccountInfo {
            index: 0,
            account_type,
            address,
            balance,
            management_state: ManagementState::Locked,
            blockchain_state: BlockchainState::Exists,
            claim_state: ClaimState::Unknown,
            must_rotate: false,
            original_kin_amount: None,
            relationship,
        }
    }

    /// Builds an orchestrator over a scripted server seeded with the
    /// given whole-Kin balances. Relationships get unique addresses.
    async fn harness(
        primary: u64,
        incoming: u64,
        slots: u64,
        relationships: &[(&str, u64)],
    ) -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let owner = Keypair::new();
        let rpc = Arc::new(ScriptedRpc::new());
        let orchestrator = FundOrchestrator::new(
            Arc::clone(&rpc) as Arc<dyn RpcClient>,
            &owner,
            Arc::new(RemoteSendLedger::new()),
            EngineConfig::default(),
        );

        {
            let tray = orchestrator.tray().await;
            rpc.seed(info(
                tray.primary_vault(),
                AccountType::Primary,
                Kin::from_kin(primary),
            ));
            rpc.seed(info(
                tray.incoming_vault(),
                AccountType::Incoming,
                Kin::from_kin(incoming),
            ));
            rpc.seed(info(
                tray.slot_vault(SlotType::Bucket1),
                AccountType::Slot(SlotType::Bucket1),
                Kin::from_kin(slots),
            ));
        }
        for (domain, balance) in relationships {
            rpc.seed(info(
                Pubkey::new_unique(),
                AccountType::Relationship(domain.to_string()),
                Kin::from_kin(*balance),
            ));
        }

        orchestrator.fetch_balance().await.unwrap();
        rpc.clear_calls();
        Harness { rpc, orchestrator }
    }

    #[tokio::test]
    async fn preflight_is_a_no_op_when_slots_cover_the_amount() {
        let h = harness(100, 10, 50, &[]).await;

        h.orchestrator
            .transfer_preflight(Kin::from_kin(40))
            .await
            .unwrap();

        assert!(h.rpc.calls().is_empty());
    }

    #[tokio::test]
    async fn preflight_pulls_incoming_then_largest_relationships() {
        let h = harness(100, 10, 0, &[("a.example", 30), ("b.example", 5)]).await;

        h.orchestrator
            .transfer_preflight(Kin::from_kin(40))
            .await
            .unwrap();

        // Incoming (10) then the largest relationship (30) satisfy the
        // amount; b.example and the primary vault are never touched.
        assert_eq!(h.rpc.calls(), vec!["incoming:10", "rel:a.example:30"]);
        assert_eq!(
            h.orchestrator.tray().await.slots_balance(),
            Kin::from_kin(40)
        );
    }

    #[tokio::test]
    async fn preflight_never_pulls_a_zero_incoming_account() {
        let h = harness(100, 0, 5, &[]).await;

        h.orchestrator
            .transfer_preflight(Kin::from_kin(50))
            .await
            .unwrap();

        let calls = h.rpc.calls();
        assert!(!calls.iter().any(|c| c.starts_with("incoming")));
        assert!(calls.iter().any(|c| c.starts_with("primary")));
    }

    #[tokio::test]
    async fn preflight_caps_primary_pull_at_the_deposit_limit() {
        let h = harness(100, 0, 0, &[]).await;
        h.rpc.set_max_deposit(Kin::from_kin(30));

        let result = h.orchestrator.transfer_preflight(Kin::from_kin(50)).await;

        assert!(matches!(result, Err(FlowError::InsufficientFunds)));
        // The partial consolidation is retained, not rolled back.
        assert!(h.rpc.calls().iter().any(|c| c == "primary:30"));
        assert_eq!(
            h.orchestrator.tray().await.slots_balance(),
            Kin::from_kin(30)
        );
    }

    #[tokio::test]
    async fn failed_relationship_pull_aborts_and_propagates() {
        let h = harness(0, 10, 0, &[("a.example", 30)]).await;
        h.rpc.fail_on("receive_from_relationship");

        let result = h.orchestrator.transfer_preflight(Kin::from_kin(40)).await;

        assert!(matches!(result, Err(FlowError::Rpc(_))));
        // The incoming pull that landed before the failure is retained.
        assert_eq!(
            h.orchestrator.tray().await.slots_balance(),
            Kin::from_kin(10)
        );
    }

    #[tokio::test]
    async fn transfer_rejects_fractional_amounts_before_any_call() {
        let h = harness(100, 0, 100, &[]).await;

        let fractional = KinAmount::from_kin(Kin::from_quarks(5 * 100_000 + 50_000));
        let result = h
            .orchestrator
            .transfer(
                fractional,
                Kin::ZERO,
                vec![],
                Pubkey::new_unique(),
                Pubkey::new_unique(),
                false,
                None,
            )
            .await;

        assert!(matches!(result, Err(FlowError::InvalidFractionalAmount)));
        assert!(h.rpc.calls().is_empty());
    }

    #[tokio::test]
    async fn transfer_rejects_amounts_above_available_before_any_call() {
        let h = harness(10, 0, 10, &[]).await;

        let result = h
            .orchestrator
            .transfer(
                KinAmount::from_kin(Kin::from_kin(100)),
                Kin::ZERO,
                vec![],
                Pubkey::new_unique(),
                Pubkey::new_unique(),
                false,
                None,
            )
            .await;

        assert!(matches!(result, Err(FlowError::InsufficientFunds)));
        assert!(h.rpc.calls().is_empty());
    }

    #[tokio::test]
    async fn transfer_consolidates_then_spends() {
        let h = harness(100, 10, 0, &[]).await;

        let balance = h
            .orchestrator
            .transfer(
                KinAmount::from_kin(Kin::from_kin(40)),
                Kin::ZERO,
                vec![],
                Pubkey::new_unique(),
                Pubkey::new_unique(),
                false,
                None,
            )
            .await
            .unwrap();

        let calls = h.rpc.calls();
        assert_eq!(calls.last().unwrap(), "transfer:40");
        assert!(calls.iter().any(|c| c == "incoming:10"));
        assert!(calls.iter().any(|c| c.starts_with("primary")));
        // 110 available before, 40 spent.
        assert_eq!(balance, Kin::from_kin(70));
    }

    #[tokio::test]
    async fn withdrawal_goes_direct_when_the_vault_covers_it() {
        let h = harness(100, 0, 0, &[]).await;

        h.orchestrator
            .withdraw_externally(
                KinAmount::from_kin(Kin::from_kin(50)),
                Pubkey::new_unique(),
            )
            .await
            .unwrap();

        assert_eq!(h.rpc.calls(), vec!["withdraw:50"]);
    }

    #[tokio::test]
    async fn withdrawal_tops_up_the_vault_from_pulled_funds() {
        let h = harness(20, 0, 0, &[("a.example", 40)]).await;

        h.orchestrator
            .withdraw_externally(
                KinAmount::from_kin(Kin::from_kin(50)),
                Pubkey::new_unique(),
            )
            .await
            .unwrap();

        // Relationship funds land in slots, an internal transfer tops
        // the vault up to 50, then the withdrawal issues.
        let calls = h.rpc.calls();
        assert_eq!(calls[0], "rel:a.example:40");
        assert!(calls.contains(&"transfer:30".to_string()));
        assert_eq!(calls.last().unwrap(), "withdraw:50");
    }

    #[tokio::test]
    async fn withdrawal_fails_when_total_funds_are_short() {
        let h = harness(20, 0, 0, &[("a.example", 40)]).await;

        let result = h
            .orchestrator
            .withdraw_externally(
                KinAmount::from_kin(Kin::from_kin(100)),
                Pubkey::new_unique(),
            )
            .await;

        assert!(matches!(result, Err(FlowError::InsufficientFunds)));
        assert!(!h.rpc.calls().iter().any(|c| c.starts_with("withdraw")));
    }

    #[tokio::test]
    async fn swap_initiates_at_most_once_per_cooldown_window() {
        let h = harness(0, 0, 0, &[]).await;
        h.rpc
            .seed(info(Pubkey::new_unique(), AccountType::Swap, Kin::from_kin(5)));

        h.orchestrator.fetch_balance().await.unwrap();
        h.orchestrator.fetch_balance().await.unwrap();

        let swaps = h.rpc.calls().iter().filter(|c| *c == "swap").count();
        assert_eq!(swaps, 1);
    }

    #[tokio::test]
    async fn fetch_balance_drains_and_rotates_a_flagged_incoming_account() {
        let h = harness(0, 10, 0, &[]).await;
        let old_vault = h.orchestrator.tray().await.incoming_vault();
        {
            let mut accounts = h.rpc.accounts.lock().unwrap();
            let entry = accounts
                .values_mut()
                .find(|i| i.account_type == AccountType::Incoming)
                .unwrap();
            entry.must_rotate = true;
        }

        let summary = h.orchestrator.fetch_balance().await.unwrap();

        assert!(h.rpc.calls().contains(&"incoming:10".to_string()));
        assert_ne!(h.orchestrator.tray().await.incoming_vault(), old_vault);
        // Funds moved to slots, so the total is unchanged.
        assert_eq!(summary.available, Kin::from_kin(10));
    }

    #[tokio::test]
    async fn fetch_balance_flags_migration_for_unlocked_accounts() {
        let h = harness(50, 0, 0, &[]).await;
        {
            let mut accounts = h.rpc.accounts.lock().unwrap();
            let entry = accounts
                .values_mut()
                .find(|i| i.account_type == AccountType::Primary)
                .unwrap();
            entry.management_state = ManagementState::Unlocked;
        }

        let summary = h.orchestrator.fetch_balance().await.unwrap();
        assert!(summary.requires_migration);
    }

    #[tokio::test]
    async fn balance_watch_publishes_after_fetch() {
        let h = harness(30, 5, 15, &[]).await;
        let rx = h.orchestrator.subscribe_balance();

        h.orchestrator.fetch_balance().await.unwrap();

        assert_eq!(*rx.borrow(), Kin::from_kin(50));
    }

    #[tokio::test]
    async fn send_remotely_records_the_card_only_on_success() {
        let h = harness(0, 0, 50, &[]).await;
        let card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));

        h.orchestrator
            .send_remotely(card.amount.clone(), Pubkey::new_unique(), &card)
            .await
            .unwrap();
        assert!(h
            .orchestrator
            .ledger()
            .lookup(&card.vault_pubkey())
            .await
            .is_some());

        // A failed funding leaves no record behind.
        let failed_card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        h.rpc.fail_on("send_remotely");
        let result = h
            .orchestrator
            .send_remotely(failed_card.amount.clone(), Pubkey::new_unique(), &failed_card)
            .await;
        assert!(result.is_err());
        assert!(h
            .orchestrator
            .ledger()
            .lookup(&failed_card.vault_pubkey())
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_send_voids_the_card_when_the_window_lapses() {
        let h = harness(0, 0, 50, &[]).await;
        let card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));

        h.orchestrator
            .send_remotely_timed(card.amount.clone(), Pubkey::new_unique(), &card)
            .await
            .unwrap();

        assert!(h
            .rpc
            .calls()
            .contains(&"receive_remote:10:void=true".to_string()));
        assert!(h
            .orchestrator
            .ledger()
            .lookup(&card.vault_pubkey())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn receive_remote_claims_an_unclaimed_card() {
        let h = harness(0, 0, 0, &[]).await;
        let card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        let mut card_info = info(card.vault_pubkey(), AccountType::RemoteSend, Kin::from_kin(10));
        card_info.claim_state = ClaimState::NotClaimed;
        card_info.original_kin_amount = Some(card.amount.clone());
        h.rpc.seed(card_info);

        let (original, balance) = h.orchestrator.receive_remote(&card).await.unwrap();

        assert_eq!(original, card.amount);
        assert_eq!(balance, Kin::from_kin(10));
        assert!(h
            .rpc
            .calls()
            .contains(&"receive_remote:10:void=false".to_string()));
    }

    #[tokio::test]
    async fn second_claim_of_the_same_card_fails() {
        let h = harness(0, 0, 0, &[]).await;
        let card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        let mut card_info = info(card.vault_pubkey(), AccountType::RemoteSend, Kin::from_kin(10));
        card_info.claim_state = ClaimState::NotClaimed;
        card_info.original_kin_amount = Some(card.amount.clone());
        h.rpc.seed(card_info);

        h.orchestrator.receive_remote(&card).await.unwrap();

        let result = h.orchestrator.receive_remote(&card).await;
        assert!(matches!(result, Err(FlowError::GiftCardClaimed)));
        // The balance was credited exactly once.
        assert_eq!(h.orchestrator.available_balance().await, Kin::from_kin(10));
    }

    #[tokio::test]
    async fn receive_remote_rejects_terminal_cards() {
        let h = harness(0, 0, 0, &[]).await;

        let claimed = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        let mut claimed_info =
            info(claimed.vault_pubkey(), AccountType::RemoteSend, Kin::from_kin(10));
        claimed_info.claim_state = ClaimState::Claimed;
        claimed_info.original_kin_amount = Some(claimed.amount.clone());
        h.rpc.seed(claimed_info);
        assert!(matches!(
            h.orchestrator.receive_remote(&claimed).await,
            Err(FlowError::GiftCardClaimed)
        ));

        let expired = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        let mut expired_info =
            info(expired.vault_pubkey(), AccountType::RemoteSend, Kin::from_kin(10));
        expired_info.claim_state = ClaimState::Expired;
        expired_info.original_kin_amount = Some(expired.amount.clone());
        h.rpc.seed(expired_info);
        assert!(matches!(
            h.orchestrator.receive_remote(&expired).await,
            Err(FlowError::GiftCardExpired)
        ));

        let unknown = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        assert!(matches!(
            h.orchestrator.receive_remote(&unknown).await,
            Err(FlowError::GiftCardBalanceNotFound)
        ));

        // No claim call was ever issued.
        assert!(!h
            .rpc
            .calls()
            .iter()
            .any(|c| c.starts_with("receive_remote")));
    }

    #[tokio::test]
    async fn missing_funding_record_outranks_claim_state() {
        let h = harness(0, 0, 0, &[]).await;

        // Claimed, but the original funding amount is gone: the card is
        // unreadable, not merely already claimed.
        let card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        let mut card_info = info(card.vault_pubkey(), AccountType::RemoteSend, Kin::ZERO);
        card_info.claim_state = ClaimState::Claimed;
        h.rpc.seed(card_info);

        assert!(matches!(
            h.orchestrator.receive_remote(&card).await,
            Err(FlowError::GiftCardBalanceNotFound)
        ));
    }

    #[tokio::test]
    async fn cancel_remote_send_reclaims_the_given_amount() {
        let h = harness(0, 0, 50, &[]).await;
        let card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));
        h.orchestrator
            .send_remotely(card.amount.clone(), Pubkey::new_unique(), &card)
            .await
            .unwrap();

        let balance = h
            .orchestrator
            .cancel_remote_send(&card, Kin::from_kin(10))
            .await
            .unwrap();

        assert_eq!(balance, Kin::from_kin(50));
        assert!(h
            .rpc
            .calls()
            .contains(&"receive_remote:10:void=true".to_string()));
        assert!(h
            .orchestrator
            .ledger()
            .lookup(&card.vault_pubkey())
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_send_settles_when_the_claim_lands_during_the_window() {
        let h = harness(0, 0, 50, &[]).await;
        let card = GiftCardAccount::generate(KinAmount::from_kin(Kin::from_kin(10)));

        // The receiver claims while the bill is still on screen. The
        // sender's ledger cannot see it, so the lapse-time void fires
        // and the server rejects it.
        let mut card_info = info(card.vault_pubkey(), AccountType::RemoteSend, Kin::ZERO);
        card_info.claim_state = ClaimState::Claimed;
        h.rpc.seed(card_info);

        let balance = h
            .orchestrator
            .send_remotely_timed(card.amount.clone(), Pubkey::new_unique(), &card)
            .await
            .unwrap();

        // The send settled: no error, no reclaimed funds, and the
        // ledger record is closed rather than stranded.
        assert_eq!(balance, Kin::from_kin(40));
        assert!(h
            .rpc
            .calls()
            .contains(&"receive_remote:10:void=true".to_string()));
        assert!(h
            .orchestrator
            .ledger()
            .lookup(&card.vault_pubkey())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn receive_if_needed_pulls_deposits_within_limits() {
        let h = harness(100, 0, 0, &[]).await;
        h.rpc.set_max_deposit(Kin::from_kin(60));

        let balance = h.orchestrator.receive_if_needed().await.unwrap();

        assert!(h.rpc.calls().contains(&"primary:60".to_string()));
        assert_eq!(balance, Kin::from_kin(100));
        assert_eq!(
            h.orchestrator.tray().await.slots_balance(),
            Kin::from_kin(60)
        );
    }

    #[tokio::test]
    async fn airdrop_pulls_the_grant_into_slots() {
        let h = harness(0, 0, 0, &[]).await;

        let (metadata, balance) = h.orchestrator.airdrop_first_kin().await.unwrap();

        assert_eq!(metadata.amount.kin, Kin::from_kin(1));
        assert_eq!(balance, Kin::from_kin(1));
        assert!(h.rpc.calls().contains(&"primary:1".to_string()));
    }

    #[tokio::test]
    async fn limits_report_stale_until_fetched() {
        let h = harness(0, 0, 0, &[]).await;
        assert!(h.orchestrator.are_limits_stale().await);
        assert_eq!(h.orchestrator.max_deposit().await, Kin::ZERO);

        h.orchestrator.update_limits().await.unwrap();

        assert!(!h.orchestrator.are_limits_stale().await);
        assert_eq!(h.orchestrator.max_deposit().await, Kin::from_kin(1_000_000));
    }
}
