//! # Privacy-Upgrade Pipeline
//!
//! Background service that upgrades already-submitted transactions to
//! their fully private form.
//!
//! ## Cycle Flow
//!
//! ```text
//! Every N seconds (or on demand):
//! 1. Fetch intents eligible for upgrade
//!               ↓
//! 2. Fan out one task per intent
//!               ↓
//! 3. Each task replays the intent's actions via the RPC boundary
//!               ↓
//! 4. Collect per-intent outcomes; log failures, never propagate them
//! ```
//!
//! Upgrades are strictly best-effort: an intent that fails this cycle is
//! simply retried on a later cycle, and one intent's failure never
//! blocks another's. The pipeline therefore has no error type; callers
//! get cycle statistics and nothing else.

use std::sync::Arc;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::rpc::RpcClient;

/// Outcome counts for one upgrade cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeCycleStats {
    pub upgraded: usize,
    pub failed: usize,
}

/// The privacy-upgrade background service.
pub struct PrivacyUpgradePipeline {
    rpc: Arc<dyn RpcClient>,
    owner: Pubkey,
    poll_interval_secs: u64,
}

impl PrivacyUpgradePipeline {
    /// `poll_interval_secs` is the loop cadence, normally
    /// [`EngineConfig::balance_poll_interval`](crate::config::EngineConfig).
    pub fn new(rpc: Arc<dyn RpcClient>, owner: Pubkey, poll_interval_secs: u64) -> Self {
        Self {
            rpc,
            owner,
            poll_interval_secs,
        }
    }

    /// Run one upgrade cycle: fetch eligible intents and attempt each
    /// concurrently. Infallible by design of the call sites; fetch
    /// failures count as an empty cycle.
    pub async fn run(&self) -> UpgradeCycleStats {
        let intents = match self.rpc.fetch_upgradeable_intents(self.owner).await {
            Ok(intents) => intents,
            Err(e) => {
                warn!("Failed to fetch upgradeable intents: {e}");
                return UpgradeCycleStats::default();
            }
        };

        if intents.is_empty() {
            debug!("No upgradeable intents");
            return UpgradeCycleStats::default();
        }

        info!("Upgrading privacy for {} intent(s)", intents.len());

        let mut set = JoinSet::new();
        for intent in intents {
            let rpc = Arc::clone(&self.rpc);
            set.spawn(async move {
                let id = intent.id;
                let result = rpc.upgrade_privacy(&intent).await;
                (id, result)
            });
        }

        let mut stats = UpgradeCycleStats::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    debug!(intent = %id, "privacy upgrade complete");
                    stats.upgraded += 1;
                }
                Ok((id, Err(e))) => {
                    warn!(intent = %id, "privacy upgrade failed: {e}");
                    stats.failed += 1;
                }
                Err(e) => {
                    warn!("privacy upgrade task panicked: {e}");
                    stats.failed += 1;
                }
            }
        }

        info!(
            "Upgrade cycle complete: {} upgraded, {} failed",
            stats.upgraded, stats.failed
        );
        stats
    }

    /// Start the periodic upgrade loop. Spawn as a background task:
    ///
    /// ```rust,ignore
    /// let pipeline = PrivacyUpgradePipeline::new(rpc, owner, config.balance_poll_interval);
    /// tokio::spawn(async move {
    ///     pipeline.start_upgrade_loop().await;
    /// });
    /// ```
    pub async fn start_upgrade_loop(&self) {
        info!(
            "Starting privacy-upgrade loop (interval: {}s)",
            self.poll_interval_secs
        );
        let mut ticker = interval(Duration::from_secs(self.poll_interval_secs));

        loop {
            ticker.tick().await;
            self.run().await;
        }
    }
}
