//! Dataset crypto properties as this crate sees them: parsed property values,
//! where they came from, and the deltas handed back to the storage layer.

use crate::error::{KeyrootError, KeyrootResult};
use crate::format::KeyFormat;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const PROP_ENCRYPTION: &str = "encryption";
pub const PROP_KEYFORMAT: &str = "keyformat";
pub const PROP_KEYLOCATION: &str = "keylocation";
pub const PROP_PBKDF2_ITERS: &str = "pbkdf2iters";
pub const PROP_PBKDF2_SALT: &str = "pbkdf2salt";
pub const PROP_KEYSTATUS: &str = "keystatus";

/// Value of the `encryption` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Crypt {
    #[default]
    Off,
    Aes128Ccm,
    Aes192Ccm,
    Aes256Ccm,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl Crypt {
    /// Suite selected by `encryption=on`.
    pub const DEFAULT_SUITE: Crypt = Crypt::Aes256Gcm;

    pub fn is_encrypted(self) -> bool {
        self != Crypt::Off
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Crypt::Off => "off",
            Crypt::Aes128Ccm => "aes-128-ccm",
            Crypt::Aes192Ccm => "aes-192-ccm",
            Crypt::Aes256Ccm => "aes-256-ccm",
            Crypt::Aes128Gcm => "aes-128-gcm",
            Crypt::Aes192Gcm => "aes-192-gcm",
            Crypt::Aes256Gcm => "aes-256-gcm",
        }
    }
}

impl fmt::Display for Crypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Crypt {
    type Err = KeyrootError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "off" => Ok(Crypt::Off),
            "on" => Ok(Crypt::DEFAULT_SUITE),
            "aes-128-ccm" => Ok(Crypt::Aes128Ccm),
            "aes-192-ccm" => Ok(Crypt::Aes192Ccm),
            "aes-256-ccm" => Ok(Crypt::Aes256Ccm),
            "aes-128-gcm" => Ok(Crypt::Aes128Gcm),
            "aes-192-gcm" => Ok(Crypt::Aes192Gcm),
            "aes-256-gcm" => Ok(Crypt::Aes256Gcm),
            other => Err(KeyrootError::invalid(format!(
                "'{other}' is not a valid encryption value"
            ))),
        }
    }
}

/// Where key material is fetched from, parsed from the `keylocation`
/// property.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyLocation {
    #[default]
    None,
    Prompt,
    File(PathBuf),
}

impl KeyLocation {
    /// Parse a property string. Unrecognised values map to `None` and are
    /// rejected when key material is fetched.
    pub fn parse(value: &str) -> Self {
        if value == "prompt" {
            return KeyLocation::Prompt;
        }
        if value.len() > 8 && value.starts_with("file:///") {
            return KeyLocation::File(PathBuf::from(&value["file://".len()..]));
        }
        KeyLocation::None
    }
}

impl fmt::Display for KeyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyLocation::None => f.write_str("none"),
            KeyLocation::Prompt => f.write_str("prompt"),
            KeyLocation::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// Source of a property value as reported by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PropSource {
    Local,
    #[default]
    Default,
    Received,
    Inherited(String),
    None,
}

/// Whether a dataset's wrapping key is currently loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStatus {
    #[default]
    Unavailable,
    Available,
}

/// Crypto-relevant properties of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatasetCryptoProps {
    pub crypt: Crypt,
    pub keyformat: KeyFormat,
    pub keylocation: KeyLocation,
    pub keylocation_source: PropSource,
    pub pbkdf2_salt: u64,
    pub pbkdf2_iters: u64,
    pub keystatus: KeyStatus,
}

impl DatasetCryptoProps {
    /// A dataset owns its key iff it is encrypted and its keylocation was
    /// not inherited.
    pub fn is_encryption_root(&self) -> bool {
        self.crypt.is_encrypted() && !matches!(self.keylocation_source, PropSource::Inherited(_))
    }

    /// Name of the ancestor the keylocation was inherited from, if any.
    pub fn inherited_from(&self) -> Option<&str> {
        match &self.keylocation_source {
            PropSource::Inherited(from) => Some(from),
            _ => None,
        }
    }
}

/// Crypto properties explicitly supplied by the caller of a create, clone or
/// rewrap. `None` means "not given".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExplicitProps {
    pub crypt: Option<Crypt>,
    pub keyformat: Option<KeyFormat>,
    pub keylocation: Option<KeyLocation>,
    pub pbkdf2_iters: Option<u64>,
}

impl ExplicitProps {
    /// Pick the crypto properties out of a create/clone property list.
    /// Other names belong to other subsystems and are left alone.
    pub fn from_props(props: &BTreeMap<String, String>) -> KeyrootResult<Self> {
        let mut explicit = ExplicitProps::default();
        for (name, value) in props {
            explicit.apply(name, value)?;
        }
        Ok(explicit)
    }

    /// Parse a rewrap property list, where only `keyformat`, `keylocation`
    /// and `pbkdf2iters` may appear.
    pub fn from_rewrap_props(props: &BTreeMap<String, String>) -> KeyrootResult<Self> {
        let mut explicit = ExplicitProps::default();
        for (name, value) in props {
            match name.as_str() {
                PROP_KEYFORMAT | PROP_KEYLOCATION | PROP_PBKDF2_ITERS => {
                    explicit.apply(name, value)?;
                }
                _ => {
                    return Err(KeyrootError::invalid(
                        "Only keyformat, keylocation and pbkdf2iters may be set with this command.",
                    ))
                }
            }
        }
        Ok(explicit)
    }

    fn apply(&mut self, name: &str, value: &str) -> KeyrootResult<()> {
        match name {
            PROP_ENCRYPTION => self.crypt = Some(value.parse()?),
            PROP_KEYFORMAT => self.keyformat = Some(value.parse()?),
            PROP_KEYLOCATION => self.keylocation = Some(KeyLocation::parse(value)),
            PROP_PBKDF2_ITERS => {
                let iters = value.parse::<u64>().map_err(|_| {
                    KeyrootError::invalid(format!("'{value}' is not a valid pbkdf2iters value"))
                })?;
                self.pbkdf2_iters = Some(iters);
            }
            _ => {}
        }
        Ok(())
    }

    /// Keyformat with "given as none" folded into "not given".
    pub fn effective_keyformat(&self) -> KeyFormat {
        self.keyformat.unwrap_or_default()
    }

    /// True if any property that only makes sense on an encrypted dataset
    /// was supplied. `encryption=off` and `keylocation=none` do not count.
    pub fn has_encryption_props(&self) -> bool {
        matches!(self.crypt, Some(crypt) if crypt.is_encrypted())
            || matches!(self.keylocation, Some(ref loc) if *loc != KeyLocation::None)
            || self.keyformat.is_some()
            || self.pbkdf2_iters.is_some()
    }
}

/// Crypto properties the storage layer is asked to persist alongside a new or
/// rewrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyDelta {
    pub keyformat: Option<KeyFormat>,
    pub keylocation: Option<KeyLocation>,
    pub pbkdf2_iters: Option<u64>,
    pub pbkdf2_salt: Option<u64>,
}

impl PropertyDelta {
    pub fn is_empty(&self) -> bool {
        *self == PropertyDelta::default()
    }

    /// Render the delta as property name/value pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(format) = self.keyformat {
            pairs.push((PROP_KEYFORMAT, format.to_string()));
        }
        if let Some(location) = &self.keylocation {
            pairs.push((PROP_KEYLOCATION, location.to_string()));
        }
        if let Some(iters) = self.pbkdf2_iters {
            pairs.push((PROP_PBKDF2_ITERS, iters.to_string()));
        }
        if let Some(salt) = self.pbkdf2_salt {
            pairs.push((PROP_PBKDF2_SALT, salt.to_string()));
        }
        pairs
    }
}

/// Lexical parent of a dataset name; pool root datasets have none.
pub fn parent_name(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn keylocation_parsing() {
        assert_eq!(KeyLocation::parse("prompt"), KeyLocation::Prompt);
        assert_eq!(
            KeyLocation::parse("file:///etc/keys/tank.key"),
            KeyLocation::File(PathBuf::from("/etc/keys/tank.key"))
        );
        assert_eq!(KeyLocation::parse("file:///"), KeyLocation::None);
        assert_eq!(KeyLocation::parse("none"), KeyLocation::None);
        assert_eq!(KeyLocation::parse("https://example.com/key"), KeyLocation::None);
        assert_eq!(KeyLocation::parse("Prompt"), KeyLocation::None);
    }

    #[test]
    fn keylocation_display_round_trips() {
        for value in ["prompt", "none", "file:///etc/keys/tank.key"] {
            assert_eq!(KeyLocation::parse(value).to_string(), value);
        }
    }

    #[test]
    fn crypt_on_means_default_suite() {
        assert_eq!("on".parse::<Crypt>().unwrap(), Crypt::Aes256Gcm);
        assert!(!"off".parse::<Crypt>().unwrap().is_encrypted());
        assert!("aes-128-ccm".parse::<Crypt>().unwrap().is_encrypted());
        assert!("rot13".parse::<Crypt>().is_err());
    }

    #[test]
    fn encryption_root_follows_keylocation_source() {
        let mut ds = DatasetCryptoProps {
            crypt: Crypt::Aes256Gcm,
            keyformat: KeyFormat::Passphrase,
            keylocation: KeyLocation::Prompt,
            keylocation_source: PropSource::Local,
            ..DatasetCryptoProps::default()
        };
        assert!(ds.is_encryption_root());

        ds.keylocation_source = PropSource::Inherited("tank/enc".into());
        assert!(!ds.is_encryption_root());
        assert_eq!(ds.inherited_from(), Some("tank/enc"));

        ds.keylocation_source = PropSource::Local;
        ds.crypt = Crypt::Off;
        assert!(!ds.is_encryption_root());
    }

    #[test]
    fn has_encryption_props_ignores_off_and_none() {
        let explicit =
            ExplicitProps::from_props(&props(&[("encryption", "off"), ("keylocation", "none")]))
                .unwrap();
        assert!(!explicit.has_encryption_props());

        let explicit = ExplicitProps::from_props(&props(&[("keyformat", "none")])).unwrap();
        assert!(explicit.has_encryption_props());

        let explicit = ExplicitProps::from_props(&props(&[("pbkdf2iters", "350000")])).unwrap();
        assert!(explicit.has_encryption_props());
    }

    #[test]
    fn create_props_ignore_foreign_names() {
        let explicit = ExplicitProps::from_props(&props(&[
            ("compression", "lz4"),
            ("keyformat", "hex"),
        ]))
        .unwrap();
        assert_eq!(explicit.keyformat, Some(KeyFormat::Hex));
        assert_eq!(explicit.crypt, None);
    }

    #[test]
    fn rewrap_props_reject_foreign_names() {
        let err = ExplicitProps::from_rewrap_props(&props(&[("compression", "lz4")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = ExplicitProps::from_rewrap_props(&props(&[("encryption", "on")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let ok = ExplicitProps::from_rewrap_props(&props(&[
            ("keyformat", "passphrase"),
            ("pbkdf2iters", "500000"),
        ]))
        .unwrap();
        assert_eq!(ok.pbkdf2_iters, Some(500_000));
    }

    #[test]
    fn pbkdf2iters_must_be_numeric() {
        let err = ExplicitProps::from_props(&props(&[("pbkdf2iters", "lots")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn parent_name_is_lexical() {
        assert_eq!(parent_name("tank/a/b"), Some("tank/a"));
        assert_eq!(parent_name("tank/a"), Some("tank"));
        assert_eq!(parent_name("tank"), None);
    }

    #[test]
    fn delta_renders_pairs_in_order() {
        let delta = PropertyDelta {
            keyformat: Some(KeyFormat::Passphrase),
            keylocation: Some(KeyLocation::Prompt),
            pbkdf2_iters: Some(350_000),
            pbkdf2_salt: Some(42),
        };
        let names: Vec<_> = delta.to_pairs().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["keyformat", "keylocation", "pbkdf2iters", "pbkdf2salt"]);
        assert!(PropertyDelta::default().is_empty());
    }
}
