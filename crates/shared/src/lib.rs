#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClubPass Shared Types and Utilities
//!
//! Ledger rows, enums, money helpers and database plumbing shared by the
//! API server, the billing engine and the background worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
