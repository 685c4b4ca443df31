//! Foundational low-level utilities shared across anketa crates.
//!
//! Provides time helpers used for timestamps and credential expiry, plus the
//! opaque identifier generators used for session ids and access links.

pub mod ids;
pub mod time_utils;

pub use ids::{generate_access_link, generate_session_id};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix};
