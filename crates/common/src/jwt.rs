//! Bearer token expiry inspection.
//!
//! The PBX identity endpoint issues JWT access tokens. This module reads the
//! `exp` claim from the payload segment without verifying the signature: the
//! client only needs to know when to refresh, the server stays the authority
//! on validity.
//!
//! Decoding is fail-closed. [`expiry`] returns `None` for anything that is
//! not a well-formed JWT carrying an `exp` claim, and callers treat a
//! credential without a derivable expiry as already expired.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;

/// Maximum token size accepted for decoding (8KB).
///
/// Tokens larger than this are rejected before any base64 work. Typical
/// access tokens are well under 1KB.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Payload claims we care about. Everything else is ignored.
#[derive(Deserialize)]
struct ExpiryClaims {
    exp: i64,
}

/// Extract the `exp` claim (Unix epoch seconds) from a compact JWT.
///
/// Returns `None` if the token is oversized, is not a three-segment compact
/// JWT, the payload segment is not valid base64url/JSON, or the payload
/// carries no `exp` claim.
#[must_use]
pub fn expiry(token: &str) -> Option<i64> {
    if token.len() > MAX_TOKEN_SIZE_BYTES {
        return None;
    }

    // Compact serialization: header.payload.signature, exactly three segments.
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    segments.next()?;
    if segments.next().is_some() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: ExpiryClaims = serde_json::from_slice(&decoded).ok()?;
    Some(claims.exp)
}
