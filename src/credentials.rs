//! Credential minting, hashing, and verification.
//!
//! A credential is `<prefix><base64url-nopad(32 random bytes)>` and is shown
//! to the caller exactly once. Only its lowercase hex SHA-256 digest is
//! persisted, together with an 8-character display prefix for UX. Digest
//! comparison is constant-time.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Number of random bytes behind each credential.
const CREDENTIAL_BYTES: usize = 32;

/// Length of the stored display prefix.
const DISPLAY_PREFIX_LEN: usize = 8;

/// A freshly minted credential. The `token` field is the only place the
/// plaintext ever exists; callers hand it to the user and drop the struct.
#[derive(Debug)]
pub struct MintedCredential {
    /// Full plaintext credential, returned to the caller exactly once.
    pub token: String,
    /// Lowercase hex SHA-256 of the plaintext; the only stored form.
    pub hash: String,
    /// First 8 characters of the plaintext, for display. Advisory only —
    /// never sufficient to authenticate.
    pub display_prefix: String,
}

/// Mint a new credential with the configured prefix (e.g. `"llmux_"`).
pub fn mint(prefix: &str) -> MintedCredential {
    let mut raw = [0u8; CREDENTIAL_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut raw);

    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
    raw.zeroize();

    let token = format!("{}{}", prefix, encoded);
    let hash = hash_credential(&token);
    let display_prefix = token.chars().take(DISPLAY_PREFIX_LEN).collect();

    MintedCredential {
        token,
        hash,
        display_prefix,
    }
}

/// Lowercase hex SHA-256 digest of a plaintext credential.
pub fn hash_credential(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time verification of a plaintext credential against a stored
/// hex digest. Malformed stored digests never verify.
pub fn verify_credential(token: &str, stored_hash: &str) -> bool {
    let stored = match hex::decode(stored_hash) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let computed = Sha256::digest(token.as_bytes());
    computed.as_slice().ct_eq(&stored).into()
}

/// Redacted form for logs and list endpoints: `<first 8>...<last 4>`.
/// Anything shorter than 13 characters collapses to `***`.
pub fn mask_credential(token: &str) -> String {
    if token.len() < 13 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..8], &token[token.len() - 4..])
}

// ── Tests ───────────────────────────────────────────────────────
