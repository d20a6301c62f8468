//! Correlation between configured keys and keys loaded into the agent.
//!
//! The agent's per-key comment is the only field that survives a round trip
//! through the agent protocol, so the configured key's id is written there
//! when the key is loaded: `chrome-ssh-agent:<id>`.  The prefix is kept
//! byte-for-byte so keys loaded by other clients using the same convention
//! resolve too.

use rand::TryRngCore as _;
use rand::rngs::OsRng;

use crate::KeyId;

/// Prefix of the comment attached to every key this manager loads.
pub const COMMENT_PREFIX: &str = "chrome-ssh-agent:";

/// Build the agent comment for `id`.
pub fn encode(id: &KeyId) -> String {
    format!("{COMMENT_PREFIX}{id}")
}

/// Recover the id from an agent comment.
///
/// Returns `None` for comments that do not carry the prefix (keys added by
/// something else).  The remainder is returned as-is.
pub fn decode(comment: &str) -> Option<KeyId> {
    comment.strip_prefix(COMMENT_PREFIX).map(KeyId::new)
}

/// Generate a fresh random id in `[0, i64::MAX]`.
pub fn generate() -> Result<KeyId, rand::rand_core::OsError> {
    let raw = OsRng.try_next_u64()?;
    Ok(KeyId::new((raw >> 1).to_string()))
}
