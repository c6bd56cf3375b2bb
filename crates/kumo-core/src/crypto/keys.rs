//! Per-device key derivation.
//!
//! Each adapter's local protocol is keyed from parameters the cloud reports for it:
//! the device serial, a hex `cryptoSerial`, and a `cryptoKeySet` tag naming the
//! derivation scheme. Derivation is pure: the same [`DeviceIdentity`] always yields
//! the same [`DeviceKeyMaterial`].
//!
//! Schemes are [`KeyDerivation`] strategies selected by [`KeySetVersion`]. An unknown
//! tag is an error rather than a fallback, since the wrong key only shows up later as
//! undecryptable traffic.
//!
//! When the cloud also reports the adapter's base64 `password`, its decoded bytes
//! are the request signing key for every scheme. The derived signing key is used
//! only for adapters that have none.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Fixed 32-byte manufacturer parameter mixed into every key and request token.
pub const W_PARAM: [u8; 32] = [
    0x44, 0xc7, 0x32, 0x83, 0xb4, 0x98, 0xd4, 0x32, 0xff, 0x25, 0xf5, 0xc8, 0xe0, 0x6a, 0x01,
    0x6a, 0xef, 0x93, 0x1e, 0x68, 0xf0, 0xa0, 0x0e, 0xa7, 0x10, 0xe3, 0x6e, 0x63, 0x38, 0xfb,
    0x22, 0xdb,
];

/// Fixed S parameter of the request token layout.
pub const S_PARAM: u8 = 0;

/// Minimum decoded length of a cryptoSerial.
pub const MIN_CRYPTO_SERIAL_LEN: usize = 9;

/// Key-derivation scheme selected by the `cryptoKeySet` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeySetVersion {
    /// Original scheme. Also used when the cloud does not report a tag.
    #[default]
    V1,
    /// HKDF-based scheme used by current firmware.
    V2,
}

impl KeySetVersion {
    /// Parses a `cryptoKeySet` tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "1" | "v1" => Some(Self::V1),
            "2" | "v2" => Some(Self::V2),
            _ => None,
        }
    }

    /// Resolves an optional tag. Absent selects V1; unknown is an error.
    pub fn resolve(tag: Option<&str>) -> Result<Self, Error> {
        match tag {
            None => Ok(Self::V1),
            Some(tag) => {
                Self::parse(tag).ok_or_else(|| Error::UnsupportedKeyVersion(tag.to_string()))
            }
        }
    }
}

impl fmt::Display for KeySetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySetVersion::V1 => write!(f, "v1"),
            KeySetVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Cloud-reported parameters that seed a device's local keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Device serial number.
    pub device_serial: String,
    /// Hex-encoded crypto serial.
    pub crypto_serial: String,
    /// Key-set tag, if the cloud reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key_set: Option<String>,
    /// Base64 adapter password, if the cloud reported one.
    #[serde(default, alias = "password", skip_serializing_if = "Option::is_none")]
    pub adapter_password: Option<String>,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_serial", &self.device_serial)
            .field("crypto_serial", &self.crypto_serial)
            .field("crypto_key_set", &self.crypto_key_set)
            .field(
                "adapter_password",
                &self.adapter_password.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl DeviceIdentity {
    /// Creates an identity.
    pub fn new(
        device_serial: impl Into<String>,
        crypto_serial: impl Into<String>,
        crypto_key_set: Option<String>,
    ) -> Self {
        Self {
            device_serial: device_serial.into(),
            crypto_serial: crypto_serial.into(),
            crypto_key_set,
            adapter_password: None,
        }
    }

    /// Sets the adapter password.
    pub fn with_adapter_password(mut self, password: impl Into<String>) -> Self {
        self.adapter_password = Some(password.into());
        self
    }

    /// Decodes the crypto serial, checking its length.
    pub fn crypto_serial_bytes(&self) -> Result<Vec<u8>, Error> {
        let bytes = hex::decode(self.crypto_serial.trim()).map_err(|e| {
            Error::InvalidIdentity(format!(
                "cryptoSerial for {} is not hex: {e}",
                self.device_serial
            ))
        })?;
        if bytes.len() < MIN_CRYPTO_SERIAL_LEN {
            return Err(Error::InvalidIdentity(format!(
                "cryptoSerial for {} is {} bytes, need at least {MIN_CRYPTO_SERIAL_LEN}",
                self.device_serial,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decodes the adapter password, if there is one.
    pub fn adapter_password_bytes(&self) -> Result<Option<Vec<u8>>, Error> {
        let Some(password) = &self.adapter_password else {
            return Ok(None);
        };
        STANDARD
            .decode(password.trim())
            .map(Some)
            .map_err(|e| {
                Error::InvalidIdentity(format!(
                    "adapter password for {} is not base64: {e}",
                    self.device_serial
                ))
            })
    }

    /// Returns the key-set version this identity selects.
    pub fn key_set_version(&self) -> Result<KeySetVersion, Error> {
        KeySetVersion::resolve(self.crypto_key_set.as_deref())
    }
}

/// Symmetric key material for one device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceKeyMaterial {
    /// Scheme that produced this material.
    pub version: KeySetVersion,
    /// AES-128 key.
    pub key: [u8; 16],
    /// CBC initialization vector.
    pub iv: [u8; 16],
    /// Key mixed into request tokens.
    pub signing_key: Vec<u8>,
    /// Decoded crypto serial, used by the request token layout.
    pub crypto_serial: Vec<u8>,
}

impl fmt::Debug for DeviceKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeyMaterial")
            .field("version", &self.version)
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// A key-derivation scheme.
pub trait KeyDerivation: Send + Sync {
    /// Version tag this scheme handles.
    fn version(&self) -> KeySetVersion;

    /// Derives key material. Must not perform I/O.
    fn derive(&self, identity: &DeviceIdentity) -> Result<DeviceKeyMaterial, Error>;
}

/// Domain labels for one scheme.
struct DerivationLabels {
    key: &'static [u8],
    iv: &'static [u8],
    signing: &'static [u8],
}

const V1_LABELS: DerivationLabels = DerivationLabels {
    key: b"lsk",
    iv: b"iv",
    signing: b"ldk",
};

const V2_LABELS: DerivationLabels = DerivationLabels {
    key: b"kumo-local-key",
    iv: b"kumo-local-iv",
    signing: b"kumo-local-sign",
};

/// Scheme V1: domain-separated SHA-256 over `W || cryptoSerial || deviceSerial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashKeyDerivation;

impl HashKeyDerivation {
    fn digest(label: &[u8], crypto_serial: &[u8], device_serial: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(W_PARAM);
        hasher.update(crypto_serial);
        hasher.update(device_serial);
        hasher.finalize().into()
    }
}

impl KeyDerivation for HashKeyDerivation {
    fn version(&self) -> KeySetVersion {
        KeySetVersion::V1
    }

    fn derive(&self, identity: &DeviceIdentity) -> Result<DeviceKeyMaterial, Error> {
        let cs = identity.crypto_serial_bytes()?;
        let serial = identity.device_serial.as_bytes();

        let key_hash = Self::digest(V1_LABELS.key, &cs, serial);
        let iv_hash = Self::digest(V1_LABELS.iv, &cs, serial);

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_hash[..16]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&iv_hash[..16]);

        let signing_key = match identity.adapter_password_bytes()? {
            Some(password) => password,
            None => Self::digest(V1_LABELS.signing, &cs, serial).to_vec(),
        };

        Ok(DeviceKeyMaterial {
            version: self.version(),
            key,
            iv,
            signing_key,
            crypto_serial: cs,
        })
    }
}

/// Scheme V2: HKDF-SHA256, cryptoSerial as salt, `W || deviceSerial` as input key.
#[derive(Debug, Clone, Copy, Default)]
pub struct HkdfKeyDerivation;

impl KeyDerivation for HkdfKeyDerivation {
    fn version(&self) -> KeySetVersion {
        KeySetVersion::V2
    }

    fn derive(&self, identity: &DeviceIdentity) -> Result<DeviceKeyMaterial, Error> {
        let cs = identity.crypto_serial_bytes()?;
        let mut ikm = Vec::with_capacity(W_PARAM.len() + identity.device_serial.len());
        ikm.extend_from_slice(&W_PARAM);
        ikm.extend_from_slice(identity.device_serial.as_bytes());

        let hkdf = Hkdf::<Sha256>::new(Some(&cs), &ikm);
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        let mut derived_signing_key = [0u8; 32];
        for (info, out) in [
            (V2_LABELS.key, &mut key[..]),
            (V2_LABELS.iv, &mut iv[..]),
            (V2_LABELS.signing, &mut derived_signing_key[..]),
        ] {
            hkdf.expand(info, out)
                .map_err(|e| Error::InvalidIdentity(format!("HKDF expand failed: {e}")))?;
        }
        let signing_key = identity
            .adapter_password_bytes()?
            .unwrap_or_else(|| derived_signing_key.to_vec());

        Ok(DeviceKeyMaterial {
            version: self.version(),
            key,
            iv,
            signing_key,
            crypto_serial: cs,
        })
    }
}

/// Returns the strategy for a version.
pub fn derivation_for(version: KeySetVersion) -> &'static dyn KeyDerivation {
    match version {
        KeySetVersion::V1 => &HashKeyDerivation,
        KeySetVersion::V2 => &HkdfKeyDerivation,
    }
}

/// Derives key material for an identity using the scheme its tag selects.
pub fn derive_key_material(identity: &DeviceIdentity) -> Result<DeviceKeyMaterial, Error> {
    let version = identity.key_set_version()?;
    derivation_for(version).derive(identity)
}
