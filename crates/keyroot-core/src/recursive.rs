//! Best-effort key loading across a dataset and all of its descendants.

use crate::acquire::KeySource;
use crate::error::{ErrorKind, KeyrootError, KeyrootResult};
use crate::manager::KeyManager;
use crate::props::{KeyLocation, KeyStatus};
use crate::provider::{DatasetTree, KeyTransport};
use log::{debug, info, warn};

/// Counts from a tree-wide load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTreeReport {
    /// Locked encryption roots a load was attempted for.
    pub attempted: u64,
    pub failed: u64,
}

impl LoadTreeReport {
    pub fn loaded(&self) -> u64 {
        self.attempted - self.failed
    }
}

/// Load the key of every locked encryption root at or below `dataset`.
///
/// One failing root never stops the walk, and a dataset whose properties
/// cannot be read is skipped while its children are still visited. The call
/// succeeds only when every attempted load succeeded; otherwise it returns
/// [`KeyrootError::PartialLoad`] with the counts. `alt_keylocation` replaces
/// the `keylocation` of every attempted root.
pub fn load_tree<P, S>(
    manager: &KeyManager<P>,
    dataset: &str,
    alt_keylocation: Option<&KeyLocation>,
    source: &mut S,
) -> KeyrootResult<LoadTreeReport>
where
    P: DatasetTree + KeyTransport,
    S: KeySource + ?Sized,
{
    let tree = manager.provider();
    if let Err(err) = tree.crypto_props(dataset) {
        if err.kind() == ErrorKind::NotFound {
            return Err(err);
        }
    }

    let mut report = LoadTreeReport::default();
    let mut pending = vec![dataset.to_string()];

    while let Some(name) = pending.pop() {
        match tree.crypto_props(&name) {
            Ok(props)
                if props.is_encryption_root() && props.keystatus == KeyStatus::Unavailable =>
            {
                report.attempted += 1;
                if let Err(err) = manager.load_key(&name, false, alt_keylocation, source) {
                    warn!("{err}");
                    report.failed += 1;
                }
            }
            Ok(_) => {}
            Err(err) => debug!("skipping {name}: {err}"),
        }

        match tree.children(&name) {
            // reversed so the stack pops them in listing order
            Ok(children) => pending.extend(children.into_iter().rev()),
            Err(err) => warn!("cannot list children of {name}: {err}"),
        }
    }

    info!(
        "{} / {} keys successfully loaded",
        report.loaded(),
        report.attempted
    );

    if report.failed > 0 {
        return Err(KeyrootError::PartialLoad {
            attempted: report.attempted,
            failed: report.failed,
        });
    }
    Ok(report)
}
