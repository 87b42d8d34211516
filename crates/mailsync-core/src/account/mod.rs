//! Account management module.
//!
//! Accounts are created from configuration seeds and afterwards only touched
//! by the scheduler (claims and cursors).

mod model;

pub use model::{
    Account, AccountId, AccountSeed, AccountStatus, ClaimState, ImapConfig, Security, SmtpConfig,
};
