//! # Services Module
//!
//! The engine's orchestration services:
//!
//! - [`FundOrchestrator`] - the single entry point for payments,
//!   withdrawals, deposits, and gift-card operations
//! - [`RemoteSendLedger`] - tracks outstanding gift cards issued by this
//!   wallet
//! - [`PrivacyUpgradePipeline`] - background fan-out that upgrades
//!   submitted transactions to their fully private form

pub mod fund_orchestrator;
pub mod privacy_upgrade;
pub mod remote_send_ledger;

pub use fund_orchestrator::{BalanceSummary, FlowError, FundOrchestrator};
pub use privacy_upgrade::{PrivacyUpgradePipeline, UpgradeCycleStats};
pub use remote_send_ledger::RemoteSendLedger;
