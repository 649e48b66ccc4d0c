//! Unguessable token generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{KvError, Result};

/// 16 chars of URL-safe base64 (96 random bits). Used for approval
/// callback tokens embedded in button payloads.
pub fn url_safe_token() -> Result<String> {
    let mut bytes = [0u8; 12];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| KvError::Backend("system RNG unavailable".into()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hex fencing token for lock ownership (128 bits).
pub fn lock_token() -> Result<String> {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| KvError::Backend("system RNG unavailable".into()))?;
    Ok(hex::encode(bytes))
}
