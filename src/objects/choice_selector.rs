use crate::utils::extract_retention_name;
use std::collections::BTreeSet;
use std::path::Path;

/// Selects every configured target.
pub const ALL_TARGETS: &str = ".";

/// Selects every retention name present in a snapshot inventory.
pub const ALL_RETENTION_NAMES: &str = "ALL";

/// A user-supplied choice over target names or retention names.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChoiceSelector(Vec<String>);

impl ChoiceSelector {
    pub fn new<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ChoiceSelector(choices.into_iter().map(Into::into).collect())
    }

    /// Resolve the choice against the set of configured target names.
    ///
    /// The literal `.` selects all targets; any other entry selects every
    /// target whose hierarchical name is relative to it.
    ///
    /// * `options` - configured target names
    ///
    pub fn resolve_target<'a, I>(&self, options: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let options: Vec<&str> = options.into_iter().collect();
        let mut resolved = Vec::new();

        for option in options {
            if self.0.iter().any(|choice| {
                choice == ALL_TARGETS || Path::new(option).starts_with(Path::new(choice))
            }) && !resolved.contains(&option.to_string())
            {
                resolved.push(option.to_string());
            }
        }

        resolved
    }

    /// Resolve the choice against the retention names of a snapshot
    /// inventory. The literal `ALL` selects every observed name.
    ///
    /// * `snapshot_names` - names of the snapshots in the inventory
    ///
    pub fn resolve_retention_name<'a, I>(&self, snapshot_names: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let observed: BTreeSet<String> = snapshot_names
            .into_iter()
            .map(|name| extract_retention_name(name).to_string())
            .collect();

        if self.0.iter().any(|choice| choice == ALL_RETENTION_NAMES) {
            return observed;
        }

        self.0
            .iter()
            .filter(|choice| observed.contains(*choice))
            .cloned()
            .collect()
    }
}
