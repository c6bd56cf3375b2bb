//! Cryptography for the local adapter protocol.
//!
//! - [`keys`]: per-device key derivation, versioned by `cryptoKeySet`
//! - [`cipher`]: AES-128-CBC payload encryption
//! - [`signing`]: the request token sent with every local request

pub mod cipher;
pub mod keys;
pub mod signing;

pub use keys::{
    DeviceIdentity, DeviceKeyMaterial, KeyDerivation, KeySetVersion, derive_key_material,
};
pub use signing::request_token;
