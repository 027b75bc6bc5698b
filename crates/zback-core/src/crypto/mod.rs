use std::io::Cursor;
use std::path::Path;

use pgp::composed::{Deserializable, Message, SignedPublicKey, SignedSecretKey};
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::ser::Serialize;

use crate::config::CryptoOptions;
use crate::error::{Result, ZbackError};

/// Extension appended to object keys when volumes are encrypted or signed.
pub const PGP_EXTENSION: &str = ".pgp";

/// OpenPGP transform applied to each volume after compression.
///
/// Sign-then-encrypt in a single message, the way `gpg --sign --encrypt`
/// lays it out: restore decrypts the outer layer and verifies the inner
/// signature against the signer's public key. Either half can be absent.
#[derive(Debug)]
pub struct VolumeCipher {
    encrypt_to: Vec<SignedPublicKey>,
    sign_with: Option<SignedSecretKey>,
    verify_with: Option<SignedPublicKey>,
    decrypt_with: Vec<SignedSecretKey>,
}

impl VolumeCipher {
    /// Resolve keys for a backup job. Returns `None` when neither
    /// encryption nor signing is requested.
    ///
    /// Fails fast, before any side effect, when a required keyring is
    /// missing or a named identity is not in it.
    pub fn for_backup(opts: &CryptoOptions) -> Result<Option<Self>> {
        if !opts.enabled() {
            return Ok(None);
        }

        let mut encrypt_to = Vec::with_capacity(opts.encrypt_to.len());
        if !opts.encrypt_to.is_empty() {
            let ring_path = opts.public_keyring.as_deref().ok_or_else(|| {
                ZbackError::InvalidInput("--encrypt-to requires a public keyring".into())
            })?;
            let ring = load_public_ring(ring_path)?;
            for recipient in &opts.encrypt_to {
                encrypt_to.push(find_public_key(&ring, recipient)?.clone());
            }
        }

        let sign_with = match &opts.sign_from {
            Some(signer) => {
                let ring_path = opts.secret_keyring.as_deref().ok_or_else(|| {
                    ZbackError::InvalidInput("--sign-from requires a secret keyring".into())
                })?;
                let ring = load_secret_ring(ring_path)?;
                Some(find_secret_key(&ring, signer)?.clone())
            }
            None => None,
        };

        Ok(Some(Self {
            encrypt_to,
            sign_with,
            verify_with: None,
            decrypt_with: Vec::new(),
        }))
    }

    /// Resolve keys for restoring a job whose manifest says it was
    /// encrypted to `encrypted` recipients and/or signed by `signer`.
    pub fn for_restore(
        opts: &CryptoOptions,
        encrypted: bool,
        signer: Option<&str>,
    ) -> Result<Option<Self>> {
        if !encrypted && signer.is_none() {
            return Ok(None);
        }

        let decrypt_with = if encrypted {
            let ring_path = opts.secret_keyring.as_deref().ok_or_else(|| {
                ZbackError::InvalidInput(
                    "job is encrypted; restoring requires a secret keyring".into(),
                )
            })?;
            load_secret_ring(ring_path)?
        } else {
            Vec::new()
        };

        let verify_with = match signer {
            Some(signer) => {
                let ring_path = opts.public_keyring.as_deref().ok_or_else(|| {
                    ZbackError::InvalidInput(
                        "job is signed; restoring requires a public keyring".into(),
                    )
                })?;
                let ring = load_public_ring(ring_path)?;
                Some(find_public_key(&ring, signer)?.clone())
            }
            None => None,
        };

        Ok(Some(Self {
            encrypt_to: Vec::new(),
            sign_with: None,
            verify_with,
            decrypt_with,
        }))
    }

    /// Sign and/or encrypt one volume payload.
    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut msg = Message::new_literal_bytes("", data);

        if let Some(signer) = &self.sign_with {
            msg = msg
                .sign(signer, String::new, HashAlgorithm::SHA2_256)
                .map_err(|e| ZbackError::Crypto(format!("signing failed: {e}")))?;
        }

        if !self.encrypt_to.is_empty() {
            let recipients: Vec<&SignedPublicKey> = self.encrypt_to.iter().collect();
            msg = msg
                .encrypt_to_keys(&mut rng, SymmetricKeyAlgorithm::AES256, &recipients)
                .map_err(|e| ZbackError::Crypto(format!("encryption failed: {e}")))?;
        }

        msg.to_bytes()
            .map_err(|e| ZbackError::Crypto(format!("message serialization failed: {e}")))
    }

    /// Decrypt and/or verify one volume payload, returning the plaintext.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut msg = Message::from_bytes(Cursor::new(data))
            .map_err(|e| ZbackError::Crypto(format!("not an OpenPGP message: {e}")))?;

        if !self.decrypt_with.is_empty() {
            let keys: Vec<&SignedSecretKey> = self.decrypt_with.iter().collect();
            let (decrypted, _key_ids) = msg
                .decrypt(String::new, &keys)
                .map_err(|e| ZbackError::Crypto(format!("decryption failed: {e}")))?;
            msg = decrypted;
        }

        if let Some(verify_key) = &self.verify_with {
            msg.verify(&verify_key.primary_key)
                .map_err(|e| ZbackError::Crypto(format!("signature verification failed: {e}")))?;
        }

        match msg
            .get_content()
            .map_err(|e| ZbackError::Crypto(format!("malformed message content: {e}")))?
        {
            Some(content) => Ok(content),
            None => Err(ZbackError::Crypto(
                "message carries no literal data".into(),
            )),
        }
    }
}

/// Load all public keys from an armored or binary keyring file.
fn load_public_ring(path: &Path) -> Result<Vec<SignedPublicKey>> {
    let raw = read_keyring(path)?;
    let keys: Vec<SignedPublicKey> = if looks_armored(&raw) {
        let (iter, _) = SignedPublicKey::from_armor_many(Cursor::new(raw))
            .map_err(|e| keyring_parse_error(path, e))?;
        iter.collect::<std::result::Result<_, _>>()
            .map_err(|e| keyring_parse_error(path, e))?
    } else {
        SignedPublicKey::from_bytes_many(Cursor::new(raw))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| keyring_parse_error(path, e))?
    };
    if keys.is_empty() {
        return Err(ZbackError::InvalidInput(format!(
            "keyring '{}' contains no public keys",
            path.display()
        )));
    }
    Ok(keys)
}

/// Load all secret keys from an armored or binary keyring file.
fn load_secret_ring(path: &Path) -> Result<Vec<SignedSecretKey>> {
    let raw = read_keyring(path)?;
    let keys: Vec<SignedSecretKey> = if looks_armored(&raw) {
        let (iter, _) = SignedSecretKey::from_armor_many(Cursor::new(raw))
            .map_err(|e| keyring_parse_error(path, e))?;
        iter.collect::<std::result::Result<_, _>>()
            .map_err(|e| keyring_parse_error(path, e))?
    } else {
        SignedSecretKey::from_bytes_many(Cursor::new(raw))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| keyring_parse_error(path, e))?
    };
    if keys.is_empty() {
        return Err(ZbackError::InvalidInput(format!(
            "keyring '{}' contains no secret keys",
            path.display()
        )));
    }
    Ok(keys)
}

fn read_keyring(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        ZbackError::InvalidInput(format!("cannot read keyring '{}': {e}", path.display()))
    })
}

fn looks_armored(raw: &[u8]) -> bool {
    raw.starts_with(b"-----BEGIN")
}

fn keyring_parse_error(path: &Path, e: pgp::errors::Error) -> ZbackError {
    ZbackError::InvalidInput(format!("cannot parse keyring '{}': {e}", path.display()))
}

fn find_public_key<'a>(ring: &'a [SignedPublicKey], ident: &str) -> Result<&'a SignedPublicKey> {
    ring.iter()
        .find(|key| key_matches(key.details.users.iter().map(|u| u.id.id().as_ref()), ident))
        .ok_or_else(|| {
            ZbackError::InvalidInput(format!("no public key for '{ident}' in keyring"))
        })
}

fn find_secret_key<'a>(ring: &'a [SignedSecretKey], ident: &str) -> Result<&'a SignedSecretKey> {
    ring.iter()
        .find(|key| key_matches(key.details.users.iter().map(|u| u.id.id().as_ref()), ident))
        .ok_or_else(|| {
            ZbackError::InvalidInput(format!("no secret key for '{ident}' in keyring"))
        })
}

fn key_matches<'a>(mut user_ids: impl Iterator<Item = &'a [u8]>, ident: &str) -> bool {
    user_ids.any(|id| String::from_utf8_lossy(id).contains(ident))
}
