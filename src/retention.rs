use crate::backup_error::BackupError;
use crate::configuration::RetentionRuleset;
use crate::utils::{extract_retention_name, parse_snapshot_name};
use chrono::{Duration, NaiveDateTime};
use log::warn;
use std::collections::{BTreeMap, BTreeSet};


/// Bucket width of a retention rule.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Interval {
    /// No bucketing, every snapshot is its own bucket.
    All,
    Every(Duration),
}

/// Upper bound of a retention rule.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DurationBound {
    Forever,
    /// Keep the N most recent snapshots.
    Count(usize),
    /// Keep snapshots younger than the window.
    Window(Duration),
}

/// Split a retention timebox token into its count and normalized unit.
///
/// `all` is only valid as an interval, `forever` and bare integers only as a
/// duration.
///
/// * `token` - timebox token, e.g. `4days`, `1year`, `all`, `forever`, `5`
/// * `is_interval` - whether the token is the interval side of a rule
///
pub(crate) fn timebox_extract(
    token: &str,
    is_interval: bool,
) -> Result<(i64, Option<String>), BackupError> {
    match token {
        "all" if is_interval => return Ok((0, Some("all".to_string()))),
        "forever" if !is_interval => return Ok((0, Some("forever".to_string()))),
        "all" | "forever" => return Err(BackupError::InvalidRetentionRule(token.to_string())),
        _ => {}
    }

    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    let count: i64 = digits
        .parse()
        .map_err(|_| BackupError::InvalidRetentionRule(token.to_string()))?;

    let unit = &token[digits.len()..];
    if unit.is_empty() {
        return match is_interval {
            true => Err(BackupError::InvalidRetentionRule(token.to_string())),
            false => Ok((count, None)),
        };
    }

    let normalized = match unit.strip_suffix('s').unwrap_or(unit) {
        "second" => "seconds",
        "minute" => "minutes",
        "hour" => "hours",
        "day" => "days",
        "week" => "weeks",
        "month" => "months",
        "year" => "years",
        _ => return Err(BackupError::InvalidRetentionRule(token.to_string())),
    };

    Ok((count, Some(normalized.to_string())))
}

fn unit_duration(count: i64, unit: &str) -> Duration {
    match unit {
        "seconds" => Duration::seconds(count),
        "minutes" => Duration::minutes(count),
        "hours" => Duration::hours(count),
        "days" => Duration::days(count),
        "weeks" => Duration::weeks(count),
        "months" => Duration::days(count * 30),
        "years" => Duration::days(count * 365),
        _ => unreachable!("unit is normalized by timebox_extract"),
    }
}

pub fn parse_interval(token: &str) -> Result<Interval, BackupError> {
    match timebox_extract(token, true)? {
        (_, Some(unit)) if unit == "all" => Ok(Interval::All),
        (count, Some(unit)) => Ok(Interval::Every(unit_duration(count, &unit))),
        (_, None) => Err(BackupError::InvalidRetentionRule(token.to_string())),
    }
}

pub fn parse_duration_bound(token: &str) -> Result<DurationBound, BackupError> {
    match timebox_extract(token, false)? {
        (_, Some(unit)) if unit == "forever" => Ok(DurationBound::Forever),
        (count, Some(unit)) => Ok(DurationBound::Window(unit_duration(count, &unit))),
        (count, None) => Ok(DurationBound::Count(count.max(0) as usize)),
    }
}

/// Apply one `interval -> duration` rule to a set of snapshot timestamps.
///
/// The timestamps are filtered by the duration bound, bucketed by
/// `floor((now - t) / interval)` and the most recent timestamp of every
/// bucket is kept. The result is ordered newest first.
///
/// * `interval` - bucket width
/// * `duration` - upper bound
/// * `timestamps` - snapshot timestamps
/// * `now` - current time in the engine timezone
///
pub fn apply_retention_rule(
    interval: &Interval,
    duration: &DurationBound,
    timestamps: &[NaiveDateTime],
    now: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    let mut timestamps = timestamps.to_vec();
    timestamps.sort_unstable();
    timestamps.reverse();

    let filtered: Vec<NaiveDateTime> = match duration {
        DurationBound::Forever => timestamps,
        DurationBound::Count(count) => timestamps.into_iter().take(*count).collect(),
        DurationBound::Window(window) => timestamps
            .into_iter()
            .filter(|timestamp| now - *timestamp <= *window)
            .collect(),
    };

    let interval = match interval {
        Interval::All => return filtered,
        Interval::Every(interval) => interval,
    };

    let mut seen_buckets = BTreeSet::new();
    let mut retained = Vec::new();

    for timestamp in filtered {
        let bucket = (now - timestamp).num_seconds() / interval.num_seconds();

        if seen_buckets.insert(bucket) {
            retained.push(timestamp);
        }
    }

    retained
}

/// Compute the retained subset of one retention class.
///
/// Ignored snapshots take part in the bucketing, so they do not hand their
/// bucket to an older neighbour, but they are subtracted from the result.
/// Names without a parseable timestamp are not considered at all.
///
/// * `snapshot_names` - full snapshot inventory
/// * `ruleset` - rules to apply; retained sets accumulate by union
/// * `retention_name` - retention class to filter the inventory to
/// * `now` - current time in the engine timezone
/// * `ignored_snapshots` - names to drop from the result unconditionally
///
pub fn retained_snapshots(
    snapshot_names: &BTreeSet<String>,
    ruleset: &RetentionRuleset,
    retention_name: &str,
    now: NaiveDateTime,
    ignored_snapshots: &BTreeSet<String>,
) -> Result<BTreeSet<String>, BackupError> {
    let mut by_timestamp: BTreeMap<NaiveDateTime, &str> = BTreeMap::new();

    for name in snapshot_names {
        if extract_retention_name(name) != retention_name {
            continue;
        }

        match parse_snapshot_name(name) {
            Ok((timestamp, _)) => {
                by_timestamp.insert(timestamp, name);
            }
            Err(_) => warn!("ignoring snapshot with unparseable name: {}", name),
        }
    }

    let timestamps: Vec<NaiveDateTime> = by_timestamp.keys().copied().collect();
    let mut retained = BTreeSet::new();

    for (interval_token, duration_token) in ruleset {
        let interval = parse_interval(interval_token)?;
        let duration = parse_duration_bound(duration_token)?;

        for timestamp in apply_retention_rule(&interval, &duration, &timestamps, now) {
            retained.insert(by_timestamp[&timestamp].to_string());
        }
    }

    Ok(retained
        .difference(ignored_snapshots)
        .cloned()
        .collect())
}
