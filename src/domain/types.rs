//! Validated newtypes for identifiers that cross the proxy boundary
//!
//! Header-derived identifiers are truncated to [`MAX_IDENTIFIER_CHARS`]
//! before validation so that oversized client input never reaches the log
//! sink.

use nutype::nutype;
#[allow(unused_imports)] // These are used by nutype derive macros
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Longest identifier accepted from a request header
pub const MAX_IDENTIFIER_CHARS: usize = 128;

/// Identifier correlating a proxied request with its log record
///
/// Clients may supply their own through `Helicone-Request-Id`; otherwise a
/// v7 UUID is generated.
#[nutype(
    sanitize(trim, with = |s: String| s.chars().take(MAX_IDENTIFIER_CHARS).collect()),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh, time-ordered request id
    pub fn generate() -> Self {
        Self::try_new(Uuid::now_v7().to_string())
            .unwrap_or_else(|_| unreachable!("a formatted UUID is never empty"))
    }

    /// Use the client-supplied id when it is usable, otherwise generate one
    pub fn from_header_or_generate(header: Option<&str>) -> Self {
        header
            .and_then(|value| Self::try_new(value.to_string()).ok())
            .unwrap_or_else(Self::generate)
    }
}

/// End-user identifier used for log attribution and rate-limit scoping
#[nutype(
    sanitize(trim, with = |s: String| s.chars().take(MAX_IDENTIFIER_CHARS).collect()),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct UserId(String);

/// Client-declared prompt identifier (`Helicone-Prompt-Id`)
#[nutype(
    sanitize(trim, with = |s: String| s.chars().take(MAX_IDENTIFIER_CHARS).collect()),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, AsRef, Display)
)]
pub struct PromptId(String);

/// Client-declared prompt name (`Helicone-Prompt-Name`)
#[nutype(
    sanitize(trim, with = |s: String| s.chars().take(MAX_IDENTIFIER_CHARS).collect()),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, AsRef, Display)
)]
pub struct PromptName(String);

/// Lowercase hex SHA-256 of a credential
///
/// Raw credentials are never stored or logged; everything keyed by a
/// credential uses this digest instead.
#[nutype(
    validate(regex = r"^[0-9a-f]{64}$"),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct HashedCredential(String);

impl HashedCredential {
    pub fn from_credential(credential: &str) -> Self {
        Self::try_new(sha256_hex(credential.as_bytes()))
            .unwrap_or_else(|_| unreachable!("sha256 hex output is always 64 lowercase hex chars"))
    }
}

/// Lowercase hex SHA-256 of arbitrary bytes
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}
