//! Password hashing and signed access tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

const HASH_SCHEME: &str = "pbkdf2-sha256";
pub const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    id: i64,
    iat: i64,
}

/// Returns `pbkdf2-sha256$<rounds>$<salt hex>$<digest hex>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        PBKDF2_ROUNDS,
        hex::encode(salt),
        hex::encode(derive_key(password, &salt, PBKDF2_ROUNDS))
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(4, '$');
    let (Some(scheme), Some(rounds), Some(salt_hex), Some(digest_hex)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != HASH_SCHEME {
        return false;
    }
    let rounds = match rounds.parse::<u32>() {
        Ok(rounds) if rounds > 0 => rounds,
        _ => return false,
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    constant_time_eq(&derive_key(password, &salt, rounds), &expected)
}

fn derive_key(password: &str, salt: &[u8], rounds: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out);
    out
}

/// Issues `base64url(claims) "." hex(hmac)`. Tokens carry no expiry.
pub fn issue_token(app_id: i64, secret: &[u8]) -> Result<String> {
    let claims = TokenClaims {
        id: app_id,
        iat: Utc::now().timestamp(),
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let sig = hmac_sha256(secret, payload.as_bytes());
    Ok(format!("{}.{}", payload, hex::encode(sig)))
}

/// Returns the app id carried by a valid token.
pub fn verify_token(token: &str, secret: &[u8]) -> Option<i64> {
    let (payload, sig_hex) = token.split_once('.')?;
    let provided = hex::decode(sig_hex).ok()?;
    let expected = hmac_sha256(secret, payload.as_bytes());
    if !constant_time_eq(&expected, &provided) {
        return None;
    }
    let raw = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: TokenClaims = serde_json::from_slice(&raw).ok()?;
    Some(claims.id)
}

fn hmac_sha256(secret: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;
    let mut key_block = [0u8; BLOCK_SIZE];
    if secret.len() > BLOCK_SIZE {
        let digest = Sha256::digest(secret);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..secret.len()].copy_from_slice(secret);
    }

    let mut o_key_pad = [0u8; BLOCK_SIZE];
    let mut i_key_pad = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        o_key_pad[i] = key_block[i] ^ 0x5c;
        i_key_pad[i] = key_block[i] ^ 0x36;
    }

    let mut inner = Sha256::new();
    inner.update(i_key_pad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(o_key_pad);
    outer.update(inner_hash);
    outer.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
