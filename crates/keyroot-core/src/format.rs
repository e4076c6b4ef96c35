//! Key formats and the length/charset rules each one imposes on raw key
//! material before derivation.

use crate::error::{KeyrootError, KeyrootResult};
use std::fmt;
use std::str::FromStr;

/// Length of every wrapping key handed to the storage layer.
pub const WRAPPING_KEY_LEN: usize = 32;

/// Shortest passphrase accepted.
pub const MIN_PASSPHRASE_LEN: usize = 8;

/// Longest passphrase accepted.
pub const MAX_PASSPHRASE_LEN: usize = 64;

/// Encoding of user-supplied key material, as stored in the `keyformat`
/// property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyFormat {
    #[default]
    None,
    Raw,
    Hex,
    Passphrase,
}

impl KeyFormat {
    /// Noun used in interactive prompts, `None` for the unencrypted format.
    pub fn prompt_label(self) -> Option<&'static str> {
        match self {
            KeyFormat::None => None,
            KeyFormat::Raw => Some("raw key"),
            KeyFormat::Hex => Some("hex key"),
            KeyFormat::Passphrase => Some("passphrase"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyFormat::None => "none",
            KeyFormat::Raw => "raw",
            KeyFormat::Hex => "hex",
            KeyFormat::Passphrase => "passphrase",
        }
    }

    /// Check the length and charset of `material` against this format.
    pub fn validate(self, material: &[u8]) -> KeyrootResult<()> {
        match self {
            KeyFormat::None => Err(KeyrootError::invalid(
                "Key material cannot be validated for keyformat 'none'.",
            )),
            KeyFormat::Raw => check_exact_len(material.len(), WRAPPING_KEY_LEN, "Raw key"),
            KeyFormat::Hex => {
                check_exact_len(material.len(), WRAPPING_KEY_LEN * 2, "Hex key")?;
                if !material.iter().all(u8::is_ascii_hexdigit) {
                    return Err(KeyrootError::invalid("Invalid hex character detected."));
                }
                Ok(())
            }
            KeyFormat::Passphrase => {
                if material.len() > MAX_PASSPHRASE_LEN {
                    return Err(KeyrootError::invalid(format!(
                        "Passphrase too long (max {MAX_PASSPHRASE_LEN})."
                    )));
                }
                if material.len() < MIN_PASSPHRASE_LEN {
                    return Err(KeyrootError::invalid(format!(
                        "Passphrase too short (min {MIN_PASSPHRASE_LEN})."
                    )));
                }
                Ok(())
            }
        }
    }
}

fn check_exact_len(len: usize, expected: usize, what: &str) -> KeyrootResult<()> {
    if len < expected {
        return Err(KeyrootError::invalid(format!(
            "{what} too short (expected {expected})."
        )));
    }
    if len > expected {
        return Err(KeyrootError::invalid(format!(
            "{what} too long (expected {expected})."
        )));
    }
    Ok(())
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyFormat {
    type Err = KeyrootError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(KeyFormat::None),
            "raw" => Ok(KeyFormat::Raw),
            "hex" => Ok(KeyFormat::Hex),
            "passphrase" => Ok(KeyFormat::Passphrase),
            other => Err(KeyrootError::invalid(format!(
                "'{other}' is not a valid keyformat (expected none, raw, hex or passphrase)"
            ))),
        }
    }
}
