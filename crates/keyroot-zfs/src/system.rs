//! System-backed [`DatasetTree`]. It shells out to the platform binaries to
//! read crypto properties, list children and check the pool's encryption
//! feature.

use crate::command::CommandRunner;
use crate::parse::{
    crypto_props_from_rows, feature_enabled, parse_children, parse_property_rows,
    pool_from_dataset, PROP_ENCRYPTION_ROOT,
};
use keyroot_core::config::KeyrootConfig;
use keyroot_core::error::{KeyrootError, KeyrootResult};
use keyroot_core::props::{
    DatasetCryptoProps, PROP_ENCRYPTION, PROP_KEYFORMAT, PROP_KEYLOCATION, PROP_KEYSTATUS,
    PROP_PBKDF2_ITERS, PROP_PBKDF2_SALT,
};
use keyroot_core::provider::DatasetTree;
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default locations searched when looking for a `zfs` binary on the host.
pub const DEFAULT_ZFS_PATHS: &[&str] = &[
    "/sbin/zfs",
    "/usr/sbin/zfs",
    "/usr/local/sbin/zfs",
    "/bin/zfs",
];

/// Default locations searched when looking for a `zpool` binary on the host.
pub const DEFAULT_ZPOOL_PATHS: &[&str] = &[
    "/sbin/zpool",
    "/usr/sbin/zpool",
    "/usr/local/sbin/zpool",
    "/bin/zpool",
];

const ENCRYPTION_FEATURE: &str = "feature@encryption";

/// [`DatasetTree`] over the native `zfs` and `zpool` CLIs.
#[derive(Clone)]
pub struct SystemZfsProvider {
    zfs_runner: CommandRunner,
    zpool_runner: CommandRunner,
}

impl SystemZfsProvider {
    /// Build a provider from configuration, discovering binaries that are
    /// not configured.
    pub fn from_config(config: &KeyrootConfig) -> KeyrootResult<Self> {
        let timeout = config.zfs_timeout();
        let zfs_runner = match config.zfs_binary_path() {
            Some(path) => Self::runner_with_path(path, timeout)?,
            None => Self::discover_binary(DEFAULT_ZFS_PATHS, "zfs", timeout)?,
        };
        let zpool_runner = match config.zpool_binary_path() {
            Some(path) => Self::runner_with_path(path, timeout)?,
            None => Self::discover_binary(DEFAULT_ZPOOL_PATHS, "zpool", timeout)?,
        };

        Ok(Self {
            zfs_runner,
            zpool_runner,
        })
    }

    /// Construct a provider with explicit `zfs` and `zpool` binaries.
    pub fn with_paths(
        zfs_path: PathBuf,
        zpool_path: PathBuf,
        timeout: Duration,
    ) -> KeyrootResult<Self> {
        Ok(Self {
            zfs_runner: Self::runner_with_path(zfs_path, timeout)?,
            zpool_runner: Self::runner_with_path(zpool_path, timeout)?,
        })
    }

    /// Auto-discover both binaries using the built-in search paths.
    pub fn discover(timeout: Duration) -> KeyrootResult<Self> {
        Ok(Self {
            zfs_runner: Self::discover_binary(DEFAULT_ZFS_PATHS, "zfs", timeout)?,
            zpool_runner: Self::discover_binary(DEFAULT_ZPOOL_PATHS, "zpool", timeout)?,
        })
    }

    fn runner_with_path(path: PathBuf, timeout: Duration) -> KeyrootResult<CommandRunner> {
        if !path.exists() {
            return Err(KeyrootError::InvalidConfig(format!(
                "binary not found at {}",
                path.display()
            )));
        }
        Ok(CommandRunner::new(path, timeout))
    }

    fn discover_binary(
        candidates: &[&str],
        name: &str,
        timeout: Duration,
    ) -> KeyrootResult<CommandRunner> {
        candidates
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| CommandRunner::new(path.to_path_buf(), timeout))
            .ok_or_else(|| {
                KeyrootError::InvalidConfig(format!(
                    "unable to locate {name} binary; tried {candidates:?}"
                ))
            })
    }
}

impl DatasetTree for SystemZfsProvider {
    fn encryption_enabled(&self, dataset: &str) -> KeyrootResult<bool> {
        let pool = pool_from_dataset(dataset).ok_or_else(|| {
            KeyrootError::InvalidArgument(format!(
                "dataset `{dataset}` does not map to a valid pool name"
            ))
        })?;
        let out = self
            .zpool_runner
            .run_checked(&["get", "-H", "-o", "value", ENCRYPTION_FEATURE, pool])?;
        Ok(feature_enabled(&out.stdout))
    }

    fn crypto_props(&self, dataset: &str) -> KeyrootResult<DatasetCryptoProps> {
        let properties = [
            PROP_ENCRYPTION,
            PROP_KEYFORMAT,
            PROP_KEYLOCATION,
            PROP_ENCRYPTION_ROOT,
            PROP_PBKDF2_SALT,
            PROP_PBKDF2_ITERS,
            PROP_KEYSTATUS,
        ]
        .join(",");
        let out = self.zfs_runner.run_checked(&[
            "get",
            "-H",
            "-p",
            "-o",
            "property,value,source",
            &properties,
            dataset,
        ])?;
        let props = crypto_props_from_rows(dataset, &parse_property_rows(&out.stdout))?;
        debug!("{dataset}: {props:?}");
        Ok(props)
    }

    fn children(&self, dataset: &str) -> KeyrootResult<Vec<String>> {
        let out = self.zfs_runner.run_checked(&[
            "list",
            "-H",
            "-o",
            "name",
            "-t",
            "filesystem,volume",
            "-d",
            "1",
            dataset,
        ])?;
        Ok(parse_children(&out.stdout, dataset))
    }
}
