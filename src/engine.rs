use crate::backup_error::BackupError;
use crate::configuration::{RestoreStrategy, SubvolumeBackupStrategy, SubvolumeFallbackStrategy};
use crate::connection::{Connection, LocalConnection};
use crate::host::BackupTargetHost;
use crate::objects::choice_selector::ALL_RETENTION_NAMES;
use crate::objects::snapshot::unescape_path;
use crate::objects::{ChoiceSelector, RetentionGroup, Snapshot};
use crate::retention::{parse_duration_bound, retained_snapshots, DurationBound};
use crate::utils::{extract_retention_name, parse_snapshot_name, TIMESTAMP_FORMAT};
use chrono::{FixedOffset, Local, NaiveDateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};


/// Magic snapshot name requesting the rollback of the last REPLACE restore.
pub const MAGIC_REPLACE: &str = "REPLACE";

#[derive(Debug, Clone, Copy)]
enum Timezone {
    Utc,
    Local,
    Fixed(FixedOffset),
}

/// Drives snapshot lifecycle operations against one or two target host
/// views.
///
/// The engine is stateless apart from the timezone used to stamp and bucket
/// snapshots; hosts are borrowed per call.
pub struct BackupEngine {
    timezone: Timezone,
    now_override: Option<NaiveDateTime>,
    send_connection: Box<dyn Connection>,
}

impl BackupEngine {
    /// * `timezone` - `utc`, `local` or a fixed offset such as `+02:00`;
    ///    anything else falls back to UTC with a warning
    ///
    pub fn new(timezone: &str) -> Self {
        let timezone = match timezone.to_ascii_lowercase().as_str() {
            "utc" => Timezone::Utc,
            "local" => Timezone::Local,
            other => match other.parse::<FixedOffset>() {
                Ok(offset) => Timezone::Fixed(offset),
                Err(_) => {
                    warn!("unknown timezone \"{}\", falling back to UTC", timezone);
                    Timezone::Utc
                }
            },
        };

        BackupEngine {
            timezone,
            now_override: None,
            send_connection: Box::new(LocalConnection::default()),
        }
    }

    #[cfg(test)]
    fn with_now(timezone: &str, now: NaiveDateTime) -> Self {
        BackupEngine {
            now_override: Some(now),
            ..Self::new(timezone)
        }
    }

    #[cfg(test)]
    fn with_send_connection(mut self, send_connection: Box<dyn Connection>) -> Self {
        self.send_connection = send_connection;
        self
    }

    fn now(&self) -> NaiveDateTime {
        if let Some(now) = self.now_override {
            return now;
        }

        match self.timezone {
            Timezone::Utc => Utc::now().naive_utc(),
            Timezone::Local => Local::now().naive_local(),
            Timezone::Fixed(offset) => Utc::now().with_timezone(&offset).naive_local(),
        }
    }

    /// Produce a snapshot name for the current instant.
    ///
    /// * `retention_name` - optional retention class suffix; `REPLACE` is
    ///    reserved for the rollback verb and rejected
    ///
    pub fn generate_snapshot_name(
        &self,
        retention_name: Option<&str>,
    ) -> Result<String, BackupError> {
        if retention_name == Some(MAGIC_REPLACE) {
            return Err(BackupError::InvalidRetentionRule(format!(
                "\"{}\" is reserved and cannot be used as a retention name",
                MAGIC_REPLACE
            )));
        }

        let stamp = self.now().format(TIMESTAMP_FORMAT);

        Ok(match retention_name {
            Some(name) => format!("{}_{}", stamp, name),
            None => stamp.to_string(),
        })
    }

    /// Create a snapshot on the source, ship it to the destination if one is
    /// known, then apply retention.
    ///
    /// * `source` - source host
    /// * `destination` - optional destination host
    /// * `snapshot_name` - name for the new snapshot
    ///
    pub fn backup(
        &self,
        source: &BackupTargetHost,
        destination: Option<&BackupTargetHost>,
        snapshot_name: &str,
    ) -> Result<(), BackupError> {
        info!(
            "backing up target \"{}\" as \"{}\"",
            source.target_name, snapshot_name
        );

        source.create_snapshot(snapshot_name)?;

        if let Some(destination) = destination {
            source.send_snapshot(
                destination,
                snapshot_name,
                self.send_connection.as_ref(),
                true,
            )?;
        }

        self.clean(source, destination)
    }

    /// Apply the target's retention rulesets and clean up the bookkeeping
    /// directories on both sides.
    pub fn clean(
        &self,
        source: &BackupTargetHost,
        destination: Option<&BackupTargetHost>,
    ) -> Result<(), BackupError> {
        let now = self.now();

        self.clean_target(
            source,
            destination,
            &ChoiceSelector::new([ALL_RETENTION_NAMES]),
            now,
        )?;
        self.clean_replace(source, now)?;
        self.clean_empty_dirs(source, destination)
    }

    /// Delete one named snapshot if it exists.
    pub fn delete(&self, host: &BackupTargetHost, snapshot_name: &str) -> Result<(), BackupError> {
        match host.snapshots()?.get(snapshot_name) {
            Some(snapshot) => host.delete_snapshot(snapshot, None),
            None => {
                warn!(
                    "snapshot \"{}\" not found on {}, nothing to delete",
                    snapshot_name, host.role
                );
                Ok(())
            }
        }
    }

    /// Delete every snapshot belonging to one of the chosen retention
    /// classes.
    ///
    /// * `host` - host to delete from
    /// * `retention_names` - choice of retention classes; `ALL` expands to
    ///    every class present
    ///
    pub fn delete_all(
        &self,
        host: &BackupTargetHost,
        retention_names: &ChoiceSelector,
    ) -> Result<(), BackupError> {
        let snapshots = host.snapshots()?;
        let selected = retention_names.resolve_retention_name(snapshots.keys().map(String::as_str));

        for (name, snapshot) in &snapshots {
            if selected.contains(extract_retention_name(name)) {
                host.delete_snapshot(snapshot, None)?;
            }
        }

        Ok(())
    }

    /// Restore a snapshot into the live subvolume tree.
    ///
    /// The magic name `REPLACE` together with the `REPLACE` strategy rolls
    /// back the most recent replace-backup instead.
    ///
    /// * `source` - source host
    /// * `destination` - optional destination host to fetch the snapshot from
    /// * `snapshot_name` - snapshot to restore
    /// * `strategy` - restore strategy to apply
    ///
    pub fn restore(
        &self,
        source: &BackupTargetHost,
        destination: Option<&BackupTargetHost>,
        snapshot_name: &str,
        strategy: RestoreStrategy,
    ) -> Result<(), BackupError> {
        match (snapshot_name == MAGIC_REPLACE, strategy) {
            (true, RestoreStrategy::Replace) => self.rollback_replace(source),
            (true, RestoreStrategy::Safe) => {
                Err(BackupError::SnapshotNotFound(MAGIC_REPLACE.to_string()))
            }
            (false, RestoreStrategy::Safe) => {
                self.restore_safe(source, destination, snapshot_name)
            }
            (false, RestoreStrategy::Replace) => {
                self.restore_replace(source, destination, snapshot_name)
            }
        }
    }

    /// Send every snapshot missing on the destination, oldest first, then
    /// clean the pair.
    pub fn sync(
        &self,
        source: &BackupTargetHost,
        destination: &BackupTargetHost,
    ) -> Result<(), BackupError> {
        let source_snapshots = source.snapshots()?;
        let destination_snapshots = destination.snapshots()?;

        for name in source_snapshots.keys() {
            if !destination_snapshots.contains_key(name) {
                source.send_snapshot(destination, name, self.send_connection.as_ref(), true)?;
            }
        }

        self.clean(source, Some(destination))
    }

    fn clean_target(
        &self,
        source: &BackupTargetHost,
        destination: Option<&BackupTargetHost>,
        retention_names: &ChoiceSelector,
        now: NaiveDateTime,
    ) -> Result<(), BackupError> {
        let source_snapshots = source.snapshots()?;
        let destination_snapshots = match destination {
            Some(destination) => Some(destination.snapshots()?),
            None => None,
        };

        let all_names: Vec<&str> = source_snapshots
            .keys()
            .chain(destination_snapshots.iter().flat_map(|snaps| snaps.keys()))
            .map(String::as_str)
            .collect();
        let selected = retention_names.resolve_retention_name(all_names);

        let mut source_groups = Vec::new();
        for retention_name in &selected {
            source_groups.push(RetentionGroup::from_target(
                retention_name,
                &source.target_config,
                true,
                BTreeSet::new(),
            ));

            // Beacons are only worth keeping for snapshots the destination
            // still holds; parent resolution needs the name on both sides.
            let obsolete = match &destination_snapshots {
                Some(destination_snapshots) => source_snapshots
                    .keys()
                    .filter(|name| extract_retention_name(name) == retention_name)
                    .filter(|name| !destination_snapshots.contains_key(*name))
                    .cloned()
                    .collect(),
                None => BTreeSet::new(),
            };
            source_groups.push(RetentionGroup::from_target(
                retention_name,
                &source.target_config,
                false,
                obsolete,
            ));
        }

        self.apply_retention(source, &source_groups, now)?;

        let Some(destination) = destination else {
            return Ok(());
        };

        let full_copy = destination.target_config.subvolume_backup_strategy
            == SubvolumeBackupStrategy::FullCopy;
        let destination_groups: Vec<RetentionGroup> = selected
            .iter()
            .map(|retention_name| {
                RetentionGroup::from_target(
                    retention_name,
                    &destination.target_config,
                    full_copy,
                    BTreeSet::new(),
                )
            })
            .collect();

        self.apply_retention(destination, &destination_groups, now)?;
        self.prune_orphans(source, destination)
    }

    /// Apply a set of retention groups to one host's inventory.
    ///
    /// Snapshots retained by no group are deleted whole; snapshots retained
    /// only by beacon groups are reduced to their root marker.
    fn apply_retention(
        &self,
        host: &BackupTargetHost,
        groups: &[RetentionGroup],
        now: NaiveDateTime,
    ) -> Result<(), BackupError> {
        let snapshots = host.snapshots()?;
        let names: BTreeSet<String> = snapshots.keys().cloned().collect();

        let mut considered = BTreeSet::new();
        let mut full_keep = BTreeSet::new();
        let mut beacon_keep = BTreeSet::new();

        for group in groups {
            considered.extend(
                names
                    .iter()
                    .filter(|name| extract_retention_name(name) == group.retention_name)
                    .filter(|name| parse_snapshot_name(name).is_ok())
                    .cloned(),
            );

            let retained = retained_snapshots(
                &names,
                &group.ruleset,
                &group.retention_name,
                now,
                &group.obsolete_snapshots,
            )?;

            match group.is_source {
                true => full_keep.extend(retained),
                false => beacon_keep.extend(retained),
            }
        }

        let doomed: Vec<&String> = considered.difference(&full_keep).collect();

        for name in doomed.iter().filter(|name| !beacon_keep.contains(**name)) {
            host.delete_snapshot(&snapshots[*name], None)?;
        }

        for name in doomed.iter().filter(|name| beacon_keep.contains(**name)) {
            let subset = host.source_subvolumes_from_snapshot(&snapshots[*name]);

            if !subset.is_empty() {
                debug!("reducing snapshot \"{}\" to its root marker", name);
                host.delete_snapshot(&snapshots[*name], Some(&subset))?;
            }
        }

        Ok(())
    }

    // Destination subvolumes absent from the same-name source snapshot are
    // stale and get pruned. Source snapshots already reduced to their root
    // marker no longer describe the composition and are skipped.
    fn prune_orphans(
        &self,
        source: &BackupTargetHost,
        destination: &BackupTargetHost,
    ) -> Result<(), BackupError> {
        let source_snapshots = source.snapshots()?;

        for (name, destination_snapshot) in &destination.snapshots()? {
            let Some(source_snapshot) = source_snapshots.get(name) else {
                continue;
            };

            if source
                .source_subvolumes_from_snapshot(source_snapshot)
                .is_empty()
            {
                continue;
            }

            let orphans: Vec<PathBuf> = destination_snapshot
                .subvolumes
                .iter()
                .filter(|subvolume| !Snapshot::is_root_marker(subvolume))
                .filter(|subvolume| !source_snapshot.subvolumes.contains(subvolume))
                .cloned()
                .collect();

            if !orphans.is_empty() {
                info!(
                    "pruning {} orphan subvolume(s) from destination snapshot \"{}\"",
                    orphans.len(),
                    name
                );
                destination.delete_snapshot(destination_snapshot, Some(&orphans))?;
            }
        }

        Ok(())
    }

    // Prune replace-backups older than the target's replace retention.
    fn clean_replace(
        &self,
        source: &BackupTargetHost,
        now: NaiveDateTime,
    ) -> Result<(), BackupError> {
        let window = match parse_duration_bound(&source.target_config.replace_retention)? {
            DurationBound::Window(window) => window,
            DurationBound::Forever => return Ok(()),
            DurationBound::Count(_) => {
                return Err(BackupError::InvalidRetentionRule(format!(
                    "replace_retention must be a duration, got \"{}\"",
                    source.target_config.replace_retention
                )))
            }
        };

        for entry in source.connection.iterdir(&source.replace_dir())? {
            let name = entry.file_name().unwrap_or_default().to_string_lossy();

            let Ok((timestamp, _)) = parse_snapshot_name(&name) else {
                warn!("ignoring foreign replace-backup entry: {}", name);
                continue;
            };

            if now - timestamp > window {
                info!("pruning replace-backup {}", entry.display());
                self.remove_replaced_targets(source, &entry)?;
            }
        }

        Ok(())
    }

    // Delete every subvolume at or below the given path, deepest first.
    fn remove_replaced_targets(
        &self,
        host: &BackupTargetHost,
        path: &Path,
    ) -> Result<(), BackupError> {
        let mut subvolumes: Vec<PathBuf> = host
            .subvolumes()?
            .into_iter()
            .filter(|subvolume| subvolume.starts_with(path))
            .collect();

        subvolumes.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| b.cmp(a))
        });

        for subvolume in subvolumes {
            host.connection.run_process(&[
                "btrfs".to_string(),
                "subvolume".to_string(),
                "delete".to_string(),
                subvolume.to_string_lossy().into_owned(),
            ])?;
        }

        Ok(())
    }

    fn clean_empty_dirs(
        &self,
        source: &BackupTargetHost,
        destination: Option<&BackupTargetHost>,
    ) -> Result<(), BackupError> {
        source.remove_empty_dirs(&source.snapshot_dir)?;
        source.remove_empty_dirs(&source.replace_dir())?;

        if let Some(destination) = destination {
            destination.remove_empty_dirs(&destination.snapshot_dir)?;
        }

        Ok(())
    }

    // Make sure the snapshot is present on the source without touching the
    // live tree, fetching it from the destination if needed.
    fn restore_safe(
        &self,
        source: &BackupTargetHost,
        destination: Option<&BackupTargetHost>,
        snapshot_name: &str,
    ) -> Result<(), BackupError> {
        if source.snapshots()?.contains_key(snapshot_name) {
            return Ok(());
        }

        if let Some(destination) = destination {
            if destination.snapshots()?.contains_key(snapshot_name) {
                info!(
                    "fetching snapshot \"{}\" back from the destination",
                    snapshot_name
                );
                return destination.send_snapshot(
                    source,
                    snapshot_name,
                    self.send_connection.as_ref(),
                    true,
                );
            }
        }

        Err(BackupError::SnapshotNotFound(snapshot_name.to_string()))
    }

    // Move the live tree aside, re-create it from the snapshot and fill the
    // gaps with the fallback strategy.
    fn restore_replace(
        &self,
        source: &BackupTargetHost,
        destination: Option<&BackupTargetHost>,
        snapshot_name: &str,
    ) -> Result<(), BackupError> {
        self.restore_safe(source, destination, snapshot_name)?;

        let snapshots = source.snapshots()?;
        let snapshot = snapshots
            .get(snapshot_name)
            .ok_or_else(|| BackupError::SnapshotNotFound(snapshot_name.to_string()))?;

        let replace_path = self.remove_target(source)?;
        self.restore_snapshot(source, snapshot, replace_path.as_deref())?;
        self.clean_replace(source, self.now())
    }

    // Roll back the most recent REPLACE: the current live tree becomes a
    // replace-backup itself, the newest one moves back into place.
    fn rollback_replace(&self, source: &BackupTargetHost) -> Result<(), BackupError> {
        let replace_dir = source.replace_dir();
        source.connection.mkdir_p(&replace_dir)?;

        let latest = source
            .connection
            .iterdir(&replace_dir)?
            .into_iter()
            .filter(|entry| {
                parse_snapshot_name(&entry.file_name().unwrap_or_default().to_string_lossy())
                    .is_ok()
            })
            .max()
            .ok_or_else(|| BackupError::SnapshotNotFound(MAGIC_REPLACE.to_string()))?;

        info!("rolling back live tree to {}", latest.display());

        self.remove_target(source)?;
        source.connection.rename(&latest, &source.target_path)?;
        self.clean_replace(source, self.now())
    }

    // Move the live subvolume tree into a timestamped replace-backup.
    // Returns its path, or None when there is no live tree.
    fn remove_target(
        &self,
        source: &BackupTargetHost,
    ) -> Result<Option<PathBuf>, BackupError> {
        if !source.connection.path_exists(&source.target_path)? {
            return Ok(None);
        }

        let replace_dir = source.replace_dir();
        source.connection.mkdir_p(&replace_dir)?;

        let backup_path = replace_dir.join(self.generate_snapshot_name(None)?);
        source.connection.rename(&source.target_path, &backup_path)?;

        Ok(Some(backup_path))
    }

    // Re-create the live tree from a snapshot with read-write snapshots,
    // then apply the fallback strategy to paths that stayed missing.
    fn restore_snapshot(
        &self,
        source: &BackupTargetHost,
        snapshot: &Snapshot,
        replace_path: Option<&Path>,
    ) -> Result<(), BackupError> {
        let parent = source
            .target_path
            .parent()
            .unwrap_or_else(|| Path::new("/"));
        source.connection.mkdir_p(parent)?;

        for subvolume in &snapshot.subvolumes {
            let relative = unescape_path(&subvolume.to_string_lossy());
            let live_path = match relative.as_os_str().is_empty() {
                true => source.target_path.clone(),
                false => source.target_path.join(&relative),
            };

            // a leftover empty directory would make the snapshot call fail
            source.connection.rmdir(&live_path)?;

            let live_parent = live_path.parent().unwrap_or_else(|| Path::new("/"));
            source.connection.mkdir_p(live_parent)?;

            source.connection.run_process(&[
                "btrfs".to_string(),
                "subvolume".to_string(),
                "snapshot".to_string(),
                snapshot
                    .subvolume_path(subvolume)
                    .to_string_lossy()
                    .into_owned(),
                live_path.to_string_lossy().into_owned(),
            ])?;
        }

        let mut candidates: Vec<PathBuf> = snapshot.subvolumes_unescaped().collect();

        if let Some(replace_path) = replace_path {
            let mut old_layout: Vec<PathBuf> = source
                .subvolumes()?
                .into_iter()
                .filter_map(|subvolume| {
                    subvolume
                        .strip_prefix(replace_path)
                        .ok()
                        .map(Path::to_path_buf)
                })
                .collect();
            old_layout.sort();

            for relative in old_layout {
                if !candidates.contains(&relative) {
                    candidates.push(relative);
                }
            }
        }

        for relative in candidates {
            self.create_fallback_subvolume(source, &relative, replace_path)?;
        }

        Ok(())
    }

    // Fill one missing live path according to the target's fallback
    // strategy. An existing live path is never overwritten.
    fn create_fallback_subvolume(
        &self,
        source: &BackupTargetHost,
        relative: &Path,
        replace_path: Option<&Path>,
    ) -> Result<(), BackupError> {
        let live_path = match relative.as_os_str().is_empty() {
            true => source.target_path.clone(),
            false => source.target_path.join(relative),
        };

        if source.connection.path_exists(&live_path)? {
            return Ok(());
        }

        let live_parent = live_path.parent().unwrap_or_else(|| Path::new("/"));

        let old_path = replace_path.map(|replace_path| match relative.as_os_str().is_empty() {
            true => replace_path.to_path_buf(),
            false => replace_path.join(relative),
        });

        match source.target_config.subvolume_fallback_strategy {
            SubvolumeFallbackStrategy::None => {
                source.connection.mkdir_p(live_parent)?;
            }
            SubvolumeFallbackStrategy::NewSubvolume => {
                self.create_empty_subvolume(source, live_parent, &live_path)?;
            }
            SubvolumeFallbackStrategy::KeepOld => match old_path {
                Some(old_path) if source.connection.path_exists(&old_path)? => {
                    source.connection.mkdir_p(live_parent)?;
                    source.connection.rename(&old_path, &live_path)?;
                }
                _ => self.create_empty_subvolume(source, live_parent, &live_path)?,
            },
        }

        Ok(())
    }

    fn create_empty_subvolume(
        &self,
        source: &BackupTargetHost,
        parent: &Path,
        path: &Path,
    ) -> Result<(), BackupError> {
        source.connection.mkdir_p(parent)?;
        source.connection.run_process(&[
            "btrfs".to_string(),
            "subvolume".to_string(),
            "create".to_string(),
            path.to_string_lossy().into_owned(),
        ])?;

        Ok(())
    }
}
