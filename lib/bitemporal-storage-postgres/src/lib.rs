//! PostgreSQL engine for bitemporal storage.
//!
//! Implements the draft lifecycle, the draft-to-version publication pipeline
//! and the comparison engine on top of sqlx. All SQL is produced as
//! [`SqlWithParams`](bitemporal_storage::SqlWithParams) values from a small
//! number of parameterized query shapes, so each operation is testable
//! independently of the database driver.
//!
//! # Modules
//!
//! - [`executor`]: pool/transaction wrappers and parameter binding
//! - [`codec`]: row encoding/decoding between typed fields and SQL tuples
//! - [`triggers`]: hash and FTS maintenance triggers
//! - [`predicate`]: criteria-to-WHERE-clause translation
//! - [`draft`]: draft table management
//! - [`publish`]: the four-way merge publication engine
//! - [`compare`]: field-level diff between storages

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::unwrap_in_result,
        clippy::panic
    )
)]

pub mod codec;
pub mod compare;
pub mod draft;
pub mod executor;
pub mod predicate;
pub mod publish;
pub mod triggers;

mod time;

pub use codec::ValueParts;
pub use compare::compare_data;
pub use draft::DraftManager;
pub use executor::{ConnectionConfig, PgPool, PgTransaction, SqlExecutor};
pub use publish::{PublishOptions, Publisher};
pub use time::{MAX_TIMESTAMP, truncate_to_seconds};
