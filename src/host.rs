use crate::backup_error::BackupError;
use crate::configuration::{BaseConfig, OnDestinationDirMissing, TargetConfig};
use crate::connection::{Connection, LocalConnection, SshConnection, Url};
use crate::objects::snapshot::escape_path;
use crate::objects::{ChoiceSelector, Snapshot};
use crate::utils::contains_path;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

#[cfg(test)]
mod tests;

/// Name of the bookkeeping directory kept at the top of the btrfs mount.
pub const BACKUP_DIR_NAME: &str = ".b4_backup";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HostRole {
    Source,
    Destination,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Source => write!(f, "source"),
            HostRole::Destination => write!(f, "destination"),
        }
    }
}

/// One side of a backup target on one end of a connection.
///
/// A source host's `target_path` is the live subvolume tree; a destination
/// host's `target_path` is the received-snapshots root. Shared behaviour
/// lives here, the role decides which verbs are legal: only a source host
/// may `create_snapshot`.
pub struct BackupTargetHost {
    pub target_name: String,
    pub target_config: TargetConfig,
    pub connection: Box<dyn Connection>,
    pub role: HostRole,
    mount_point: PathBuf,
    pub snapshot_dir: PathBuf,
    pub target_path: PathBuf,
}

impl BackupTargetHost {
    /// Build the source-side view of a target.
    ///
    /// * `target_name` - hierarchical name of the target
    /// * `target_config` - the target's configuration
    /// * `connection` - connection holding the live subvolume tree
    ///
    pub fn from_source_host(
        target_name: &str,
        target_config: TargetConfig,
        connection: Box<dyn Connection>,
    ) -> Result<Self, BackupError> {
        let mount_point = Self::resolve_mount_point(connection.as_ref())?;
        let snapshot_dir = mount_point
            .join(BACKUP_DIR_NAME)
            .join("snapshots")
            .join(target_name);
        let target_path = connection.location();

        Ok(BackupTargetHost {
            target_name: target_name.to_string(),
            target_config,
            connection,
            role: HostRole::Source,
            mount_point,
            snapshot_dir,
            target_path,
        })
    }

    /// Build the destination-side view of a target.
    ///
    /// Fails with [`BackupError::DestinationDirectoryNotFound`] when the
    /// destination directory does not exist; the caller decides whether that
    /// is fatal (`ERROR`) or skips the host (`SKIP`).
    pub fn from_destination_host(
        target_name: &str,
        target_config: TargetConfig,
        connection: Box<dyn Connection>,
    ) -> Result<Self, BackupError> {
        let location = connection.location();

        if !connection.path_exists(&location)? {
            return Err(BackupError::DestinationDirectoryNotFound(location));
        }

        let mount_point = Self::resolve_mount_point(connection.as_ref())?;
        let snapshot_dir = location.join("snapshots").join(target_name);

        Ok(BackupTargetHost {
            target_name: target_name.to_string(),
            target_config,
            connection,
            role: HostRole::Destination,
            mount_point,
            snapshot_dir,
            target_path: location,
        })
    }

    /// The btrfs mount point containing this side of the target.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Directory holding the replace-backups of this target.
    pub fn replace_dir(&self) -> PathBuf {
        self.mount_point
            .join(BACKUP_DIR_NAME)
            .join("replace")
            .join(&self.target_name)
    }

    // Longest btrfs mount point that contains the connection's location.
    fn resolve_mount_point(connection: &dyn Connection) -> Result<PathBuf, BackupError> {
        let output = connection.run_process(&["mount".to_string()])?;
        let location = connection.location();

        let mut candidates: Vec<&str> = output
            .lines()
            .filter_map(|line| {
                let (_, rest) = line.split_once(" on ")?;
                let (mount_point, rest) = rest.split_once(" type ")?;
                let fs_type = rest.split_whitespace().next()?;

                (fs_type == "btrfs").then_some(mount_point)
            })
            .filter(|mount_point| location.starts_with(mount_point))
            .collect();

        candidates.sort_by_key(|mount_point| mount_point.len());

        candidates
            .last()
            .map(|mount_point| PathBuf::from(*mount_point))
            .ok_or_else(|| BackupError::BtrfsPartitionNotFound(location))
    }

    /// All subvolume paths visible on this side, absolute, starting with the
    /// mount point itself.
    pub fn subvolumes(&self) -> Result<Vec<PathBuf>, BackupError> {
        let output = self.connection.run_process(&[
            "btrfs".to_string(),
            "subvolume".to_string(),
            "list".to_string(),
            self.mount_point.to_string_lossy().into_owned(),
        ])?;

        let mut subvolumes = vec![self.mount_point.clone()];

        for line in output.lines() {
            if let Some((_, path)) = line.split_once(" path ") {
                subvolumes.push(self.mount_point.join(path.trim()));
            }
        }

        Ok(subvolumes)
    }

    /// The snapshot inventory of this side: every immediate child of the
    /// snapshot directory, with all subvolumes below it grouped in discovery
    /// order.
    pub fn snapshots(&self) -> Result<BTreeMap<String, Snapshot>, BackupError> {
        let mut snapshots: BTreeMap<String, Snapshot> = BTreeMap::new();

        for subvolume in self.subvolumes()? {
            let relative = match subvolume.strip_prefix(&self.snapshot_dir) {
                Ok(relative) if relative.as_os_str().is_empty() => continue,
                Ok(relative) => relative,
                Err(_) => continue,
            };

            let mut components = relative.components();
            let name = components
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default();
            let rest: PathBuf = components.collect();

            snapshots
                .entry(name.clone())
                .or_insert_with(|| Snapshot {
                    name,
                    base_path: self.snapshot_dir.clone(),
                    subvolumes: Vec::new(),
                })
                .subvolumes
                .push(rest);
        }

        Ok(snapshots)
    }

    /// Create a read-only snapshot of the live subvolume tree. Source role
    /// only.
    ///
    /// * `snapshot_name` - name of the snapshot directory to create
    ///
    pub fn create_snapshot(&self, snapshot_name: &str) -> Result<Snapshot, BackupError> {
        let kept: Vec<PathBuf> = self
            .subvolumes()?
            .into_iter()
            .filter(|subvolume| subvolume.starts_with(&self.target_path))
            .filter(|subvolume| {
                !self
                    .target_config
                    .ignored_subvolumes
                    .iter()
                    .any(|ignored| contains_path(subvolume, ignored))
            })
            .collect();

        if kept.is_empty() {
            return Err(BackupError::BtrfsSubvolumeNotFound(self.target_path.clone()));
        }

        let snapshot_path = self.snapshot_dir.join(snapshot_name);
        self.connection.mkdir_p(&snapshot_path)?;

        let mut members = Vec::new();

        for subvolume in kept {
            let relative = subvolume
                .strip_prefix(&self.target_path)
                .expect("filtered to target_path above");
            let escaped = escape_path(relative);

            self.connection.run_process(&[
                "btrfs".to_string(),
                "subvolume".to_string(),
                "snapshot".to_string(),
                "-r".to_string(),
                subvolume.to_string_lossy().into_owned(),
                snapshot_path.join(&escaped).to_string_lossy().into_owned(),
            ])?;

            members.push(PathBuf::from(escaped));
        }

        info!(
            "created snapshot \"{}\" with {} subvolume(s) on {}",
            snapshot_name,
            members.len(),
            self.role
        );

        Ok(Snapshot {
            name: snapshot_name.to_string(),
            base_path: self.snapshot_dir.clone(),
            subvolumes: members,
        })
    }

    /// Delete a snapshot, or a subset of its subvolumes.
    ///
    /// A full deletion removes the root marker before its nested subvolumes
    /// and finishes by removing the snapshot directory; a subset deletion
    /// removes nested subvolumes first and leaves the directory alone. An
    /// empty subset is a no-op.
    ///
    /// * `snapshot` - snapshot to delete from
    /// * `subset` - subvolumes to delete instead of the whole snapshot
    ///
    pub fn delete_snapshot(
        &self,
        snapshot: &Snapshot,
        subset: Option<&[PathBuf]>,
    ) -> Result<(), BackupError> {
        let is_root = |subvolume: &PathBuf| {
            Snapshot::is_root_marker(subvolume) || subvolume.as_os_str().is_empty()
        };

        let ordered: Vec<&PathBuf> = match subset {
            None => {
                let (roots, nested): (Vec<&PathBuf>, Vec<&PathBuf>) =
                    snapshot.subvolumes.iter().partition(|s| is_root(s));

                roots.into_iter().chain(nested).collect()
            }
            Some(subset) => {
                let (roots, nested): (Vec<&PathBuf>, Vec<&PathBuf>) =
                    subset.iter().partition(|s| is_root(s));

                nested.into_iter().chain(roots).collect()
            }
        };

        if subset.is_some() && ordered.is_empty() {
            return Ok(());
        }

        for subvolume in ordered {
            self.connection.run_process(&[
                "btrfs".to_string(),
                "subvolume".to_string(),
                "delete".to_string(),
                snapshot
                    .subvolume_path(subvolume)
                    .to_string_lossy()
                    .into_owned(),
            ])?;
        }

        if subset.is_none() {
            self.connection.rmdir(&snapshot.path())?;
        }

        debug!(
            "deleted snapshot \"{}\" ({}) on {}",
            snapshot.name,
            if subset.is_some() { "partial" } else { "full" },
            self.role
        );

        Ok(())
    }

    /// Transmit a named snapshot from this host to another one.
    ///
    /// A snapshot already present on the destination is left alone. With
    /// `incremental` set the best common parent is used as the differential
    /// base for every subvolume it shares with the new snapshot; everything
    /// else is sent full.
    ///
    /// * `destination` - host to receive the snapshot
    /// * `snapshot_name` - name of the snapshot to send
    /// * `send_connection` - connection carrying the pipe; remote ends
    ///    contribute their `exec_prefix`
    /// * `incremental` - whether to look for a common parent
    ///
    pub fn send_snapshot(
        &self,
        destination: &BackupTargetHost,
        snapshot_name: &str,
        send_connection: &dyn Connection,
        incremental: bool,
    ) -> Result<(), BackupError> {
        let snapshots = self.snapshots()?;
        let snapshot = snapshots
            .get(snapshot_name)
            .ok_or_else(|| BackupError::SnapshotNotFound(snapshot_name.to_string()))?;

        let destination_snapshots = destination.snapshots()?;
        if destination_snapshots.contains_key(snapshot_name) {
            debug!(
                "snapshot \"{}\" already present on {}",
                snapshot_name, destination.role
            );
            return Ok(());
        }

        let parent = match incremental {
            true => Self::nearest_matching_snapshot(
                snapshot_name,
                &snapshots.keys().cloned().collect(),
                &destination_snapshots.keys().cloned().collect(),
            )
            .and_then(|name| snapshots.get(&name)),
            false => None,
        };

        match parent {
            Some(parent) => info!(
                "sending snapshot \"{}\" incrementally on top of \"{}\"",
                snapshot_name, parent.name
            ),
            None => info!("sending snapshot \"{}\" in full", snapshot_name),
        }

        let destination_dir = destination.snapshot_dir.join(snapshot_name);
        destination.connection.mkdir_p(&destination_dir)?;

        let source_prefix = match self.connection.is_remote() {
            true => self.connection.exec_prefix(),
            false => String::new(),
        };
        let destination_prefix = match destination.connection.is_remote() {
            true => destination.connection.exec_prefix(),
            false => String::new(),
        };

        for subvolume in &snapshot.subvolumes {
            let parent_arg = parent
                .filter(|parent| parent.subvolumes.contains(subvolume))
                .map(|parent| format!("-p '{}' ", parent.subvolume_path(subvolume).display()))
                .unwrap_or_default();

            let pipeline = format!(
                "{}btrfs send {}'{}' | {}btrfs receive {}",
                source_prefix,
                parent_arg,
                snapshot.subvolume_path(subvolume).display(),
                destination_prefix,
                destination_dir.display(),
            );

            send_connection.run_process(&[
                "bash".to_string(),
                "-c".to_string(),
                pipeline,
            ])?;
        }

        Ok(())
    }

    // The common snapshot name lexically closest to the given one, preferring
    // the closest older name over the closest younger one.
    fn nearest_matching_snapshot(
        snapshot_name: &str,
        source_names: &BTreeSet<String>,
        destination_names: &BTreeSet<String>,
    ) -> Option<String> {
        let common: BTreeSet<&String> = source_names
            .intersection(destination_names)
            .filter(|name| name.as_str() != snapshot_name)
            .collect();

        let older = common
            .iter()
            .filter(|name| name.as_str() < snapshot_name)
            .next_back();
        let younger = common
            .iter()
            .find(|name| name.as_str() > snapshot_name);

        older.or(younger).map(|name| name.to_string())
    }

    /// Depth-first removal of empty non-subvolume directories under `root`.
    /// Never descends into a subvolume. Returns whether `root` itself ended
    /// up empty.
    pub fn remove_empty_dirs(&self, root: &Path) -> Result<bool, BackupError> {
        let subvolumes: BTreeSet<PathBuf> = self.subvolumes()?.into_iter().collect();

        self.remove_empty_dirs_inner(root, &subvolumes)
    }

    fn remove_empty_dirs_inner(
        &self,
        dir: &Path,
        subvolumes: &BTreeSet<PathBuf>,
    ) -> Result<bool, BackupError> {
        if subvolumes.contains(dir) {
            return Ok(false);
        }

        let mut empty = true;

        for child in self.connection.iterdir(dir)? {
            if subvolumes.contains(&child) {
                empty = false;
                continue;
            }

            match self.remove_empty_dirs_inner(&child, subvolumes)? {
                true => self.connection.rmdir(&child)?,
                false => empty = false,
            }
        }

        Ok(empty)
    }

    /// The snapshot's subvolumes that came from live subvolumes other than
    /// the target root.
    pub fn source_subvolumes_from_snapshot(&self, snapshot: &Snapshot) -> Vec<PathBuf> {
        snapshot
            .subvolumes
            .iter()
            .filter(|subvolume| {
                !Snapshot::is_root_marker(subvolume) && !subvolume.as_os_str().is_empty()
            })
            .cloned()
            .collect()
    }
}

/// Build the (source, destination) host pair for every selected target.
///
/// Construction errors are reported per target so one unreachable target
/// does not abort the rest.
///
/// * `target_choice` - choice over the configured target names
/// * `config` - loaded configuration
/// * `offline` - build no destination hosts
///
pub fn host_generator(
    target_choice: &ChoiceSelector,
    config: &BaseConfig,
    offline: bool,
) -> Vec<(
    String,
    Result<(BackupTargetHost, Option<BackupTargetHost>), BackupError>,
)> {
    host_generator_with(target_choice, config, offline, &target_connection)
}

// Separated from the connection factory so tests can substitute one.
fn host_generator_with(
    target_choice: &ChoiceSelector,
    config: &BaseConfig,
    offline: bool,
    connect: &dyn Fn(&str) -> Result<Box<dyn Connection>, BackupError>,
) -> Vec<(
    String,
    Result<(BackupTargetHost, Option<BackupTargetHost>), BackupError>,
)> {
    target_choice
        .resolve_target(config.target_names())
        .into_iter()
        .map(|target_name| {
            let result = build_hosts(&target_name, config, offline, connect);

            (target_name, result)
        })
        .collect()
}

fn build_hosts(
    target_name: &str,
    config: &BaseConfig,
    offline: bool,
    connect: &dyn Fn(&str) -> Result<Box<dyn Connection>, BackupError>,
) -> Result<(BackupTargetHost, Option<BackupTargetHost>), BackupError> {
    let target_config = config.backup_targets[target_name].clone();

    let source_host = BackupTargetHost::from_source_host(
        target_name,
        target_config.clone(),
        connect(&target_config.source)?,
    )?;

    let destination = match offline {
        true => None,
        false => target_config.destination.clone(),
    };

    let destination_host = match destination {
        None => None,
        Some(url) => {
            match BackupTargetHost::from_destination_host(
                target_name,
                target_config.clone(),
                connect(&url)?,
            ) {
                Ok(host) => Some(host),
                Err(BackupError::DestinationDirectoryNotFound(path))
                    if target_config.on_destination_dir_missing
                        == OnDestinationDirMissing::Skip =>
                {
                    warn!(
                        "skipping missing destination directory {} of target \"{}\"",
                        path.display(),
                        target_name
                    );
                    None
                }
                Err(error) => return Err(error),
            }
        }
    };

    Ok((source_host, destination_host))
}

// Remote connections are kept open for the rest of the batch so
// per-subvolume commands do not reopen a session each time.
fn target_connection(url: &str) -> Result<Box<dyn Connection>, BackupError> {
    let parsed = Url::from_url(url)?;

    match parsed.protocol.as_deref() {
        None => Ok(Box::new(LocalConnection::new(parsed.location.clone()))),
        Some("ssh") => {
            let mut connection = SshConnection::from_url(&parsed)?;
            connection.set_keep_open(true);

            Ok(Box::new(connection))
        }
        Some(protocol) => Err(BackupError::UnknownProtocol(protocol.to_string())),
    }
}
