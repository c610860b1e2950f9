use crate::configuration::{RetentionRuleset, TargetConfig};
use std::collections::BTreeSet;

/// A planning value tying one retention class on one side of a target to the
/// ruleset governing it.
///
/// Groups with `is_source` set protect their retained snapshots whole; groups
/// without it protect only the root marker, which acts as the parent beacon
/// for incremental sends.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RetentionGroup {
    pub retention_name: String,
    pub ruleset: RetentionRuleset,
    pub is_source: bool,
    /// Snapshot names that are deleted no matter what the rules retain.
    pub obsolete_snapshots: BTreeSet<String>,
}

impl RetentionGroup {
    /// Build the group for one retention name from a target's configuration.
    ///
    /// * `retention_name` - retention class to look up
    /// * `target` - target owning the retention dictionaries
    /// * `is_source` - whether to read the source-side dictionary
    /// * `obsolete_snapshots` - seed of the "must delete" set
    ///
    pub fn from_target(
        retention_name: &str,
        target: &TargetConfig,
        is_source: bool,
        obsolete_snapshots: BTreeSet<String>,
    ) -> Self {
        let retention = match is_source {
            true => &target.src_retention,
            false => &target.dst_retention,
        };

        RetentionGroup {
            retention_name: retention_name.to_string(),
            ruleset: target.resolve_ruleset(retention, retention_name),
            is_source,
            obsolete_snapshots,
        }
    }
}
