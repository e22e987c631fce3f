//! Server-assigned client identifiers.
//!
//! Ids look like `client-3f9a0c1b2d4e`: a fixed prefix followed by 48 random
//! bits in lowercase hex. Uniqueness is the only requirement, so the
//! thread-local RNG is sufficient.

use std::fmt;

use rand::Rng;

/// Prefix shared by every generated id.
pub const CLIENT_ID_PREFIX: &str = "client-";

/// Prefix of the welcome text that carries the assigned id.
pub const WELCOME_PREFIX: &str = "Welcome! Your client ID is: ";

/// Number of random bits in a generated id.
const RANDOM_BITS: u32 = 48;

/// Logical identity of one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let bits: u64 = rand::thread_rng().gen::<u64>() & ((1u64 << RANDOM_BITS) - 1);
        Self(format!("{}{:012x}", CLIENT_ID_PREFIX, bits))
    }

    /// Borrow the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Welcome text sent to the peer right after accept.
    pub fn welcome_text(&self) -> String {
        format!("{}{}", WELCOME_PREFIX, self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extract the assigned id from a welcome payload.
///
/// Returns `None` if the payload is not UTF-8 or lacks the welcome prefix.
pub fn parse_welcome(payload: &[u8]) -> Option<ClientId> {
    let text = std::str::from_utf8(payload).ok()?;
    let id = text.strip_prefix(WELCOME_PREFIX)?.trim();
    if id.is_empty() {
        return None;
    }
    Some(ClientId::from(id))
}
