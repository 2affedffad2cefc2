//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. Use [`SecretString`] for the OAuth
//! client secret and for bearer tokens: `Debug` output is redacted, so any
//! struct that derives `Debug` over a secret field is safe to log, and the
//! value is zeroized on drop. Reading the inner value requires an explicit
//! `expose_secret()` call at the site that actually sends it over the wire.

pub use secrecy::{ExposeSecret, SecretString};
