//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers can unwrap the Redis URL
//! without depending on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};
