//! Helpers for turning `zfs` and `zpool` CLI output into the core crate's
//! property model.

use keyroot_core::error::{KeyrootError, KeyrootResult};
use keyroot_core::props::{
    Crypt, DatasetCryptoProps, KeyLocation, KeyStatus, PropSource, PROP_ENCRYPTION,
    PROP_KEYFORMAT, PROP_KEYLOCATION, PROP_KEYSTATUS, PROP_PBKDF2_ITERS, PROP_PBKDF2_SALT,
};
use keyroot_core::KeyFormat;

pub(crate) const PROP_ENCRYPTION_ROOT: &str = "encryptionroot";

/// One row of `zfs get -H -o property,value,source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PropertyRow {
    pub property: String,
    pub value: String,
    pub source: PropSource,
}

/// Split `-H` output into property rows. Columns are tab separated; a value
/// may itself contain spaces.
pub(crate) fn parse_property_rows(output: &str) -> Vec<PropertyRow> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split('\t');
            let property = columns.next()?.trim();
            let value = columns.next()?.trim();
            if property.is_empty() {
                return None;
            }
            let source = parse_source(columns.next().unwrap_or("-").trim());
            Some(PropertyRow {
                property: property.to_string(),
                value: value.to_string(),
                source,
            })
        })
        .collect()
}

/// Map the CLI's source column onto [`PropSource`].
pub(crate) fn parse_source(source: &str) -> PropSource {
    match source {
        "local" | "temporary" => PropSource::Local,
        "default" => PropSource::Default,
        "received" => PropSource::Received,
        other => match other.strip_prefix("inherited from ") {
            Some(from) => PropSource::Inherited(from.trim().to_string()),
            None => PropSource::None,
        },
    }
}

/// Assemble crypto properties for `dataset` from `zfs get` rows.
///
/// Newer releases report the keylocation of a non-root as a default rather
/// than as inherited, so `encryptionroot` decides the source whenever it
/// names another dataset.
pub(crate) fn crypto_props_from_rows(
    dataset: &str,
    rows: &[PropertyRow],
) -> KeyrootResult<DatasetCryptoProps> {
    let mut props = DatasetCryptoProps::default();
    let mut encryption_root = None;

    for row in rows {
        let value = row.value.as_str();
        match row.property.as_str() {
            PROP_ENCRYPTION => props.crypt = parse_value::<Crypt>(dataset, row)?,
            PROP_KEYFORMAT => props.keyformat = parse_value::<KeyFormat>(dataset, row)?,
            PROP_KEYLOCATION => {
                props.keylocation = KeyLocation::parse(value);
                props.keylocation_source = row.source.clone();
            }
            PROP_PBKDF2_SALT => props.pbkdf2_salt = parse_number(dataset, row)?,
            PROP_PBKDF2_ITERS => props.pbkdf2_iters = parse_number(dataset, row)?,
            PROP_KEYSTATUS => props.keystatus = parse_keystatus(value),
            PROP_ENCRYPTION_ROOT if !is_unset(value) => encryption_root = Some(value),
            _ => {}
        }
    }

    if let Some(root) = encryption_root {
        if root != dataset {
            props.keylocation_source = PropSource::Inherited(root.to_string());
        }
    }
    Ok(props)
}

/// Translate the raw `keystatus` field.
pub(crate) fn parse_keystatus(value: &str) -> KeyStatus {
    match value {
        "available" => KeyStatus::Available,
        _ => KeyStatus::Unavailable,
    }
}

/// `zpool get feature@encryption` reports `disabled`, `enabled` or `active`.
pub(crate) fn feature_enabled(value: &str) -> bool {
    matches!(value.trim(), "enabled" | "active")
}

/// Dataset names from `zfs list -H -o name`, minus `parent` itself.
pub(crate) fn parse_children(output: &str, parent: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != parent)
        .map(str::to_string)
        .collect()
}

/// Peel off the pool name prefix from a dataset identifier.
pub(crate) fn pool_from_dataset(dataset: &str) -> Option<&str> {
    let candidate = dataset.split('/').next()?;
    if candidate.is_empty() {
        None
    } else {
        Some(candidate)
    }
}

fn is_unset(value: &str) -> bool {
    value.is_empty() || value == "-"
}

fn parse_value<T: std::str::FromStr>(dataset: &str, row: &PropertyRow) -> KeyrootResult<T> {
    row.value.parse::<T>().map_err(|_| unexpected(dataset, row))
}

fn parse_number(dataset: &str, row: &PropertyRow) -> KeyrootResult<u64> {
    if is_unset(&row.value) {
        return Ok(0);
    }
    row.value.parse::<u64>().map_err(|_| unexpected(dataset, row))
}

fn unexpected(dataset: &str, row: &PropertyRow) -> KeyrootError {
    KeyrootError::Provider(format!(
        "unexpected {} value `{}` for {}",
        row.property, row.value, dataset
    ))
}
