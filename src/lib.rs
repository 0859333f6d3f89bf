//! # Wallet Flow Engine
//!
//! The fund-orchestration engine of a privacy-preserving mobile wallet.
//! It decides, for every payment, withdrawal, deposit, and gift-card
//! operation, *which* sub-accounts to move value through and *in what
//! order*, while respecting server-issued spending limits, account lock
//! states, and the linkage-privacy properties the ledger depends on.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     FundOrchestrator                          │
//! │  • fetch_balance()   • transfer()     • withdraw_externally() │
//! │  • send_remotely()   • receive_remote()                       │
//! │  • receive_if_needed()  • update_limits()                     │
//! └──────────────────────────────────────────────────────────────┘
//!          │                  │                    │
//!          ▼                  ▼                    ▼
//!   ┌────────────┐    ┌──────────────┐    ┌────────────────────┐
//!   │ AccountTray│    │ RemoteSend   │    │ PrivacyUpgrade     │
//!   │  balances, │    │ Ledger       │    │ Pipeline           │
//!   │  sub-accts │    │  gift cards  │    │  background fanout │
//!   └────────────┘    └──────────────┘    └────────────────────┘
//!          │
//!          ▼
//!   ┌────────────┐
//!   │ RpcClient  │  abstract async boundary to the server
//!   └────────────┘
//! ```
//!
//! The application shell talks only to [`FundOrchestrator`]. Balance is
//! fragmented across a primary vault, a rotating incoming account, optional
//! swap and per-counterparty relationship accounts, and a set of slot
//! accounts, the only accounts a payment may be directly funded from.
//! Before any externally visible spend, the orchestrator consolidates
//! enough balance into slots via an order-sensitive preflight.
//!
//! [`FundOrchestrator`]: services::FundOrchestrator

pub mod config;
pub mod models;
pub mod rpc;
pub mod services;
pub mod tray;

pub use config::EngineConfig;
pub use models::{
    AccountInfo, AirdropType, ClaimState, CurrencyCode, GiftCardAccount, Kin, KinAmount, Limits,
    ManagementState, PaymentMetadata, Rate, SendLimit, UpgradeableIntent,
};
pub use rpc::{RpcClient, RpcError};
pub use services::{
    BalanceSummary, FlowError, FundOrchestrator, PrivacyUpgradePipeline, RemoteSendLedger,
    UpgradeCycleStats,
};
pub use tray::{AccountTray, TraySnapshot};
