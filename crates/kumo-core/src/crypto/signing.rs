//! Request token carried in the `m` query parameter.
//!
//! The token is SHA-256 over an 88-byte block:
//!
//! | bytes  | content                              |
//! |--------|--------------------------------------|
//! | 0..32  | `W`                                  |
//! | 32..64 | `sha256(signing_key \|\| body)`      |
//! | 64..66 | `0x08 0x40`                          |
//! | 66     | `S`                                  |
//! | 67..79 | zero                                 |
//! | 79     | `cs[8]`                              |
//! | 80..84 | `cs[4..8]`                           |
//! | 84..88 | `cs[0..4]`                           |
//!
//! `signing_key` is the decoded adapter password when the cloud reports one.

use sha2::{Digest, Sha256};

use super::keys::{DeviceKeyMaterial, MIN_CRYPTO_SERIAL_LEN, S_PARAM, W_PARAM};
use crate::error::Error;

const TOKEN_BLOCK_LEN: usize = 88;

/// Computes the hex request token for an (encrypted) request body.
pub fn request_token(material: &DeviceKeyMaterial, body: &[u8]) -> Result<String, Error> {
    let cs = &material.crypto_serial;
    if cs.len() < MIN_CRYPTO_SERIAL_LEN {
        return Err(Error::InvalidIdentity(format!(
            "cryptoSerial is {} bytes, need at least {MIN_CRYPTO_SERIAL_LEN}",
            cs.len()
        )));
    }

    let mut body_hasher = Sha256::new();
    body_hasher.update(&material.signing_key);
    body_hasher.update(body);
    let body_hash = body_hasher.finalize();

    let mut block = [0u8; TOKEN_BLOCK_LEN];
    block[0..32].copy_from_slice(&W_PARAM);
    block[32..64].copy_from_slice(&body_hash);
    block[64] = 0x08;
    block[65] = 0x40;
    block[66] = S_PARAM;
    block[79] = cs[8];
    block[80..84].copy_from_slice(&cs[4..8]);
    block[84..88].copy_from_slice(&cs[0..4]);

    Ok(hex::encode(Sha256::digest(block)))
}
