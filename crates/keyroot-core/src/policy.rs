//! Encryption-root policy: pure decisions about whether a create, clone or
//! rewrap is legal, whether the dataset becomes an encryption root, and
//! whether a new wrapping key has to be collected. Nothing here performs I/O.

use crate::config::Pbkdf2Cfg;
use crate::error::{KeyrootError, KeyrootResult};
use crate::format::KeyFormat;
use crate::props::{
    Crypt, DatasetCryptoProps, ExplicitProps, KeyLocation, KeyStatus, PropertyDelta,
};

/// Outcome of a create or clone check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoDecision {
    /// The new dataset is not encrypted.
    NotEncrypted,
    /// Encrypted, sharing an ancestor's wrapping key.
    InheritOnly,
    /// A new encryption root; key material must be collected.
    NewRoot(KeyPlan),
}

impl CryptoDecision {
    pub fn key_plan(&self) -> Option<&KeyPlan> {
        match self {
            CryptoDecision::NewRoot(plan) => Some(plan),
            _ => None,
        }
    }
}

/// How to collect the new wrapping key and what to persist with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPlan {
    pub keyformat: KeyFormat,
    pub keylocation: KeyLocation,
    /// `keylocation` was not supplied and fell back to `prompt`.
    pub keylocation_defaulted: bool,
    /// Properties to persist alongside the key, before salt/iterations.
    pub delta: PropertyDelta,
}

/// Which kind of key change a rewrap performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewrapMode {
    /// Replace the wrapping key with newly collected material.
    Rekey,
    /// Stop being an encryption root and use the parent's key.
    InheritFromParent,
}

/// Outcome of a rewrap check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewrapPlan {
    Rekey(KeyPlan),
    Inherit,
}

/// Check a dataset creation under a parent whose encryption is
/// `parent_crypt` (`Off` for a pool's root dataset).
pub fn create_decision(
    parent_crypt: Crypt,
    explicit: &ExplicitProps,
    feature_enabled: bool,
) -> KeyrootResult<CryptoDecision> {
    if !feature_enabled {
        if explicit.has_encryption_props() {
            return Err(KeyrootError::invalid("Encryption feature not enabled."));
        }
        return Ok(CryptoDecision::NotEncrypted);
    }

    if explicit.crypt == Some(Crypt::Off) && parent_crypt.is_encrypted() {
        return Err(KeyrootError::invalid(
            "Invalid encryption value. Dataset must be encrypted.",
        ));
    }

    let crypt = explicit.crypt.unwrap_or(parent_crypt);
    if !crypt.is_encrypted() {
        if explicit.has_encryption_props() {
            return Err(KeyrootError::invalid(
                "Encryption must be turned on to set encryption properties.",
            ));
        }
        return Ok(CryptoDecision::NotEncrypted);
    }

    let keyformat = explicit.effective_keyformat();
    if !parent_crypt.is_encrypted()
        && explicit.keylocation.is_none()
        && keyformat == KeyFormat::None
    {
        return Err(KeyrootError::invalid(
            "Keyformat required for new encryption root.",
        ));
    }

    Ok(match new_root_plan(explicit)? {
        Some(plan) => CryptoDecision::NewRoot(plan),
        None => CryptoDecision::InheritOnly,
    })
}

/// Check a clone of an origin with encryption `origin_crypt` and key status
/// `origin_keystatus` into a parent with encryption `parent_crypt`.
pub fn clone_decision(
    parent_crypt: Crypt,
    origin_crypt: Crypt,
    origin_keystatus: KeyStatus,
    explicit: &ExplicitProps,
) -> KeyrootResult<CryptoDecision> {
    if explicit.crypt.is_some() {
        return Err(KeyrootError::invalid(
            "Encryption may not be specified during cloning.",
        ));
    }

    if parent_crypt.is_encrypted() && !origin_crypt.is_encrypted() {
        return Err(KeyrootError::invalid(
            "Cannot create unencrypted clone as child of encrypted parent.",
        ));
    }

    if !origin_crypt.is_encrypted() {
        if explicit.has_encryption_props() {
            return Err(KeyrootError::invalid(
                "Encryption properties may not be set for an unencrypted clone.",
            ));
        }
        return Ok(CryptoDecision::NotEncrypted);
    }

    let plan = new_root_plan(explicit)?;

    if origin_keystatus != KeyStatus::Available {
        return Err(KeyrootError::AccessDenied(
            "Origin wrapping key must be loaded.".to_string(),
        ));
    }

    if !parent_crypt.is_encrypted() && explicit.effective_keyformat() == KeyFormat::None {
        return Err(KeyrootError::invalid("Keyformat required."));
    }

    Ok(match plan {
        Some(plan) => CryptoDecision::NewRoot(plan),
        None => CryptoDecision::InheritOnly,
    })
}

/// Check a rewrap of `current`. `parent` is the parent's properties, or
/// `None` when the dataset has no parent; it is only consulted when
/// inheriting.
pub fn rewrap_decision(
    current: &DatasetCryptoProps,
    mode: RewrapMode,
    explicit: &ExplicitProps,
    parent: Option<&DatasetCryptoProps>,
) -> KeyrootResult<RewrapPlan> {
    if !current.crypt.is_encrypted() {
        return Err(KeyrootError::invalid("Dataset not encrypted."));
    }

    let plan = match mode {
        RewrapMode::Rekey => {
            let keyformat = match explicit.effective_keyformat() {
                KeyFormat::None => current.keyformat,
                given => given,
            };
            let keylocation = explicit
                .keylocation
                .clone()
                .unwrap_or_else(|| current.keylocation.clone());
            RewrapPlan::Rekey(KeyPlan {
                keyformat,
                keylocation,
                keylocation_defaulted: false,
                delta: PropertyDelta {
                    keyformat: explicit.keyformat,
                    keylocation: explicit.keylocation.clone(),
                    ..PropertyDelta::default()
                },
            })
        }
        RewrapMode::InheritFromParent => {
            if !current.is_encryption_root() {
                return Err(KeyrootError::invalid(
                    "Key inheriting can only be performed on encryption roots.",
                ));
            }
            let parent =
                parent.ok_or_else(|| KeyrootError::invalid("Root dataset cannot inherit key."))?;
            if !parent.crypt.is_encrypted() {
                return Err(KeyrootError::invalid("Parent must be encrypted."));
            }
            if parent.keystatus != KeyStatus::Available {
                return Err(KeyrootError::AccessDenied(
                    "Parent key must be loaded.".to_string(),
                ));
            }
            RewrapPlan::Inherit
        }
    };

    if current.keystatus != KeyStatus::Available {
        return Err(KeyrootError::AccessDenied("Key must be loaded.".to_string()));
    }

    Ok(plan)
}

/// Iteration count to store with a new key, `None` for formats without one.
pub fn resolve_pbkdf2_iters(
    keyformat: KeyFormat,
    explicit_iters: Option<u64>,
    policy: &Pbkdf2Cfg,
) -> KeyrootResult<Option<u64>> {
    match (keyformat, explicit_iters) {
        (KeyFormat::Passphrase, Some(iters)) if iters < policy.min_iters => {
            Err(KeyrootError::invalid(format!(
                "pbkdf2iters must be at least {}.",
                policy.min_iters
            )))
        }
        (KeyFormat::Passphrase, given) => Ok(Some(given.unwrap_or(policy.default_iters))),
        (_, Some(_)) => Err(KeyrootError::invalid(
            "Cannot specify pbkdf2iters with a non-passphrase keyformat.",
        )),
        (_, None) => Ok(None),
    }
}

/// Shared keyformat/keylocation pairing for create and clone: a keylocation
/// needs a keyformat, and a lone keyformat implies `prompt`.
fn new_root_plan(explicit: &ExplicitProps) -> KeyrootResult<Option<KeyPlan>> {
    let keyformat = explicit.effective_keyformat();
    match (&explicit.keylocation, keyformat) {
        (Some(_), KeyFormat::None) => Err(KeyrootError::invalid(
            "Keyformat required for new encryption root.",
        )),
        (Some(location), format) => Ok(Some(KeyPlan {
            keyformat: format,
            keylocation: location.clone(),
            keylocation_defaulted: false,
            delta: PropertyDelta {
                keyformat: Some(format),
                keylocation: Some(location.clone()),
                ..PropertyDelta::default()
            },
        })),
        (None, KeyFormat::None) => Ok(None),
        (None, format) => Ok(Some(KeyPlan {
            keyformat: format,
            keylocation: KeyLocation::Prompt,
            keylocation_defaulted: true,
            delta: PropertyDelta {
                keyformat: Some(format),
                keylocation: Some(KeyLocation::Prompt),
                ..PropertyDelta::default()
            },
        })),
    }
}
