//! # Models Module
//!
//! Domain types shared across the engine: quark-precise amounts,
//! sub-account state, spending limits, gift cards, and upgrade intents.

pub mod account;
pub mod amount;
pub mod gift_card;
pub mod intent;
pub mod limits;

pub use account::{
    AccountInfo, AccountType, BlockchainState, ClaimState, ManagementState, Relationship, SlotType,
};
pub use amount::{CurrencyCode, Kin, KinAmount, Rate, QUARKS_PER_KIN};
pub use gift_card::{GiftCardAccount, GiftCardRecord};
pub use intent::{AirdropType, PaymentMetadata, PrivateAction, UpgradeableIntent};
pub use limits::{Limits, SendLimit, LIMITS_STALENESS_MINUTES};
