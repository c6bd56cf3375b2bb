//! AES-128-CBC payload cipher for the local protocol.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use serde_json::Value;

use super::keys::DeviceKeyMaterial;
use crate::error::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Encrypts raw bytes with PKCS#7 padding.
pub fn encrypt(material: &DeviceKeyMaterial, plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(&material.key.into(), &material.iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts raw bytes and strips PKCS#7 padding.
pub fn decrypt(material: &DeviceKeyMaterial, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(Error::Decryption(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }
    Aes128CbcDec::new(&material.key.into(), &material.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption("invalid padding".into()))
}

/// Serializes and encrypts a JSON payload.
pub fn seal_json(material: &DeviceKeyMaterial, payload: &Value) -> Result<Vec<u8>, Error> {
    let plaintext = serde_json::to_vec(payload)?;
    Ok(encrypt(material, &plaintext))
}

/// Decrypts a body and parses it as JSON.
///
/// Any failure, including plaintext that is not JSON, is a [`Error::Decryption`]:
/// the usual cause is a key mismatch.
pub fn open_json(material: &DeviceKeyMaterial, ciphertext: &[u8]) -> Result<Value, Error> {
    let plaintext = decrypt(material, ciphertext)?;
    let text = std::str::from_utf8(&plaintext)
        .map_err(|_| Error::Decryption("plaintext is not UTF-8".into()))?;
    serde_json::from_str(text.trim_end_matches('\0'))
        .map_err(|e| Error::Decryption(format!("plaintext is not JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crypto::keys::{DeviceIdentity, derive_key_material};

    fn material(crypto_serial: &str) -> DeviceKeyMaterial {
        derive_key_material(&DeviceIdentity::new(
            "2234P008M100013F",
            crypto_serial,
            Some("2".into()),
        ))
        .unwrap()
    }

    #[test]
    fn test_json_roundtrip_is_byte_identical() {
        let key = material("0a1b2c3d4e5f60718293");
        let payload = json!({"c": {"indoorUnit": {"status": {}}}});
        let sealed = seal_json(&key, &payload).unwrap();
        assert_eq!(sealed.len() % 16, 0);
        let plaintext = decrypt(&key, &sealed).unwrap();
        assert_eq!(plaintext, serde_json::to_vec(&payload).unwrap());
        assert_eq!(open_json(&key, &sealed).unwrap(), payload);
    }

    #[test]
    fn test_wrong_key_is_decryption_error() {
        let sealed = seal_json(&material("0a1b2c3d4e5f60718293"), &json!({"r": {}})).unwrap();
        let err = open_json(&material("ffeeddccbbaa99887766"), &sealed).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[test]
    fn test_bad_length_is_decryption_error() {
        let key = material("0a1b2c3d4e5f60718293");
        assert!(matches!(decrypt(&key, &[]), Err(Error::Decryption(_))));
        assert!(matches!(decrypt(&key, &[0u8; 15]), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_non_json_plaintext_is_decryption_error() {
        let key = material("0a1b2c3d4e5f60718293");
        let sealed = encrypt(&key, b"not json at all");
        assert!(matches!(open_json(&key, &sealed), Err(Error::Decryption(_))));
    }
}
