#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billgate Shared
//!
//! Types and plumbing used by every Billgate crate: the Postgres pool,
//! embedded migrations, and the account model owned by the identity flow.

pub mod account;
pub mod db;

pub use account::Account;
pub use db::{create_pool, run_migrations};
