//! Foundational low-level utilities shared across Stash crates.
//!
//! Provides atomic file-write helpers, time utilities, and the durable
//! authenticated-account-id list used by the login flow.

pub mod atomic_io;
pub mod id_store;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use id_store::{read_account_ids, record_account_id};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
