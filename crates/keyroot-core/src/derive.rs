//! Turn validated key material into the 32-byte wrapping key.
//!
//! Raw keys are copied and hex keys decoded. Passphrases are stretched with
//! PBKDF2-HMAC-SHA1, whose output has to match keys already on disk bit for
//! bit, salt encoding included.

use crate::error::{KeyrootError, KeyrootResult};
use crate::format::{KeyFormat, WRAPPING_KEY_LEN};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fmt;
use zeroize::Zeroizing;

type HmacSha1 = Hmac<Sha1>;

const SHA1_DIGEST_LEN: usize = 20;

/// The secret that wraps a dataset's on-disk encryption key. Wiped on drop.
pub struct WrappingKey(Zeroizing<[u8; WRAPPING_KEY_LEN]>);

impl WrappingKey {
    pub fn from_bytes(bytes: [u8; WRAPPING_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; WRAPPING_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey([redacted])")
    }
}

/// Derive a wrapping key from `material` according to `format`.
///
/// `iters` and `salt` are only read for passphrases; the salt is fed to the
/// HMAC as its 8-byte little-endian encoding.
pub fn derive_key(
    format: KeyFormat,
    iters: u64,
    material: &[u8],
    salt: u64,
) -> KeyrootResult<WrappingKey> {
    let mut key = Zeroizing::new([0u8; WRAPPING_KEY_LEN]);

    match format {
        KeyFormat::Raw => {
            if material.len() != WRAPPING_KEY_LEN {
                return Err(KeyrootError::invalid(format!(
                    "Raw key must be exactly {WRAPPING_KEY_LEN} bytes."
                )));
            }
            key.copy_from_slice(material);
        }
        KeyFormat::Hex => {
            hex::decode_to_slice(material, &mut key[..])
                .map_err(|err| KeyrootError::invalid(format!("Invalid hex key provided: {err}.")))?;
        }
        KeyFormat::Passphrase => {
            // passphrases end at the first NUL byte
            let end = material
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(material.len());
            pbkdf2_hmac_sha1(&material[..end], &salt.to_le_bytes(), iters, &mut key[..])
                .map_err(|err| err.context("Failed to generate key from passphrase"))?;
        }
        KeyFormat::None => {
            return Err(KeyrootError::invalid(
                "Cannot derive a wrapping key for keyformat 'none'.",
            ))
        }
    }

    Ok(WrappingKey(key))
}

/// PBKDF2 with HMAC-SHA1 as the PRF, filling `output` completely.
///
/// Block `i` (1-based) is `U1 ^ U2 ^ ... ^ Uc` where
/// `U1 = HMAC(passphrase, salt || BE32(i))` and `Uj = HMAC(passphrase, Uj-1)`;
/// the last block is truncated to fit.
pub fn pbkdf2_hmac_sha1(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u64,
    output: &mut [u8],
) -> KeyrootResult<()> {
    if iterations == 0 {
        return Err(KeyrootError::invalid("PBKDF2 requires at least one iteration."));
    }

    let prf = <HmacSha1 as Mac>::new_from_slice(passphrase)
        .map_err(|err| KeyrootError::invalid(format!("invalid HMAC key: {err}")))?;

    for (index, chunk) in output.chunks_mut(SHA1_DIGEST_LEN).enumerate() {
        let block_index = u32::try_from(index + 1)
            .map_err(|_| KeyrootError::invalid("PBKDF2 output length too large."))?;

        let mut mac = prf.clone();
        mac.update(salt);
        mac.update(&block_index.to_be_bytes());

        let mut u = Zeroizing::new([0u8; SHA1_DIGEST_LEN]);
        u.copy_from_slice(&mac.finalize().into_bytes());
        let mut block = Zeroizing::new(*u);

        for _ in 1..iterations {
            let mut mac = prf.clone();
            mac.update(&u[..]);
            u.copy_from_slice(&mac.finalize().into_bytes());
            for (acc, byte) in block.iter_mut().zip(u.iter()) {
                *acc ^= byte;
            }
        }

        chunk.copy_from_slice(&block[..chunk.len()]);
    }

    Ok(())
}
