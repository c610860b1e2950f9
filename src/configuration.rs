use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Key of the template target whose settings seed every other target.
pub const DEFAULT_TARGET: &str = "_default";

/// An ordered mapping from an interval token to a duration token,
/// e.g. `1hours -> 1day`.
pub type RetentionRuleset = BTreeMap<String, String>;

/// Behaviour when the destination directory of a target does not exist.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDestinationDirMissing {
    #[default]
    Error,
    Skip,
}

/// How a restore touches the live subvolume tree.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreStrategy {
    #[default]
    Safe,
    Replace,
}

/// How nested subvolumes fare on the destination.
///
/// `FullCopy` retains destination snapshots whole under the destination
/// ruleset; `SourceOnly` keeps only their root markers there, so nested
/// subvolume payloads exist on the source alone.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubvolumeBackupStrategy {
    #[default]
    FullCopy,
    SourceOnly,
}

/// What to do with a live subvolume that is absent from a restored snapshot.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubvolumeFallbackStrategy {
    #[default]
    NewSubvolume,
    KeepOld,
    None,
}

/// Configuration of one named backup target.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// URL of the live subvolume tree.
    pub source: String,
    /// URL of the backup destination, if any.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub on_destination_dir_missing: OnDestinationDirMissing,
    #[serde(default)]
    pub restore_strategy: RestoreStrategy,
    #[serde(default)]
    pub subvolume_backup_strategy: SubvolumeBackupStrategy,
    #[serde(default)]
    pub subvolume_fallback_strategy: SubvolumeFallbackStrategy,
    /// Subpaths whose subvolumes are left out of snapshots.
    #[serde(default)]
    pub ignored_subvolumes: Vec<PathBuf>,
    /// Maximum age of replace-backups before `clean` prunes them.
    #[serde(default = "default_replace_retention")]
    pub replace_retention: String,
    /// Source-side retention rulesets keyed by retention name.
    #[serde(default)]
    pub src_retention: BTreeMap<String, RetentionRuleset>,
    /// Destination-side retention rulesets keyed by retention name.
    #[serde(default)]
    pub dst_retention: BTreeMap<String, RetentionRuleset>,
}

fn default_replace_retention() -> String {
    "1days".to_string()
}

impl TargetConfig {
    /// Look up the ruleset for a retention name, falling back to the
    /// target's `_default` entry and finally to `all -> forever`, so nothing
    /// is ever deleted without an explicit rule.
    pub fn resolve_ruleset(
        &self,
        retention: &BTreeMap<String, RetentionRuleset>,
        retention_name: &str,
    ) -> RetentionRuleset {
        retention
            .get(retention_name)
            .or_else(|| retention.get(DEFAULT_TARGET))
            .cloned()
            .unwrap_or_else(|| {
                BTreeMap::from([("all".to_string(), "forever".to_string())])
            })
    }
}

/// Top level configuration of the tool.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct BaseConfig {
    /// Timezone used to stamp and bucket snapshots: `utc`, `local` or a
    /// fixed offset such as `+02:00`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Targets used by commands invoked without an explicit choice.
    #[serde(default)]
    pub default_targets: Vec<String>,
    #[serde(default)]
    pub backup_targets: BTreeMap<String, TargetConfig>,
}

fn default_timezone() -> String {
    "utc".to_string()
}

impl BaseConfig {
    /// Read and validate a configuration file.
    ///
    /// * `filepath` - path of the JSON configuration file
    ///
    pub fn read_from_file(filepath: &Path) -> Result<Self> {
        let file = File::open(filepath).context(format!(
            "could not open configuration file \"{}\"",
            filepath.display()
        ))?;

        let mut config: BaseConfig = serde_json::from_reader(file)?;
        config.copy_from_default_retention();
        config.validate()?;

        Ok(config)
    }

    /// Names of all configured targets, without the template entry.
    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.backup_targets
            .keys()
            .map(String::as_str)
            .filter(|name| *name != DEFAULT_TARGET)
    }

    // Retention rulesets must not merge nested, so the template target's
    // entries are copied shallowly into every target that lacks them.
    fn copy_from_default_retention(&mut self) {
        let default_target = match self.backup_targets.get(DEFAULT_TARGET) {
            Some(target) => target.clone(),
            None => return,
        };

        for target in self.backup_targets.values_mut() {
            for (retention_name, ruleset) in &default_target.src_retention {
                target
                    .src_retention
                    .entry(retention_name.clone())
                    .or_insert_with(|| ruleset.clone());
            }

            for (retention_name, ruleset) in &default_target.dst_retention {
                target
                    .dst_retention
                    .entry(retention_name.clone())
                    .or_insert_with(|| ruleset.clone());
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for default_target in &self.default_targets {
            if !self
                .target_names()
                .any(|name| Path::new(name).starts_with(Path::new(default_target)))
            {
                bail!(
                    "default target \"{}\" does not select any configured target",
                    default_target
                );
            }
        }

        Ok(())
    }
}
