//! Shared test doubles for host and engine tests.

use crate::backup_error::BackupError;
use crate::connection::MockConnection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub(crate) type CallLog = Arc<Mutex<Vec<Vec<String>>>>;

pub(crate) const MOUNT_OUTPUT: &str = "/dev/sda1 on /boot type ext4 (rw,relatime)\n\
    /dev/sda3 on /opt type btrfs (rw,relatime,discard=async,space_cache=v2,subvolid=5,subvol=/)\n";

pub(crate) fn strs(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn list_output(paths: &[&str]) -> String {
    paths
        .iter()
        .map(|path| format!("ID 256 gen 621621 top_level 5 path {}\n", path))
        .collect()
}

/// A connection double that answers read commands (`mount`, `btrfs subvolume
/// list`, `ls`) from canned data and records every issued command.
pub(crate) fn routed_connection(
    location: &str,
    subvolume_list: String,
    listings: Vec<(String, String)>,
    missing: Vec<String>,
) -> (MockConnection, CallLog) {
    let mut mock = MockConnection::new();
    mock.expect_location()
        .return_const(PathBuf::from(location));
    mock.expect_is_remote().return_const(false);
    mock.expect_exec_prefix().return_const(String::new());

    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let recorded = log.clone();

    mock.expect_run_process().returning(move |argv| {
        recorded.lock().unwrap().push(argv.to_vec());

        let argv_strs: Vec<&str> = argv.iter().map(String::as_str).collect();
        match argv_strs.as_slice() {
            ["mount"] => Ok(MOUNT_OUTPUT.to_string()),
            ["btrfs", "subvolume", "list", _] => Ok(subvolume_list.clone()),
            ["ls", "-d", path] => match missing.iter().any(|m| m == path) {
                true => Err(BackupError::FailedProcess {
                    argv: argv.to_vec(),
                    stdout: String::new(),
                    stderr: format!("ls: cannot access '{}': No such file or directory", path),
                }),
                false => Ok(format!("{}\n", path)),
            },
            ["ls", path] => Ok(listings
                .iter()
                .find(|(dir, _)| dir == path)
                .map(|(_, output)| output.clone())
                .unwrap_or_default()),
            _ => Ok(String::new()),
        }
    });

    (mock, log)
}

/// The state-changing commands of a call log; the canned read commands are
/// filtered out.
pub(crate) fn mutations(log: &CallLog) -> Vec<Vec<String>> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|argv| match argv[0].as_str() {
            "mount" | "ls" => false,
            "btrfs" => argv[2] != "list",
            _ => true,
        })
        .cloned()
        .collect()
}

/// A bare connection double recording the commands piped through it.
pub(crate) fn recording_connection() -> (MockConnection, CallLog) {
    let mut mock = MockConnection::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let recorded = log.clone();

    mock.expect_run_process().returning(move |argv| {
        recorded.lock().unwrap().push(argv.to_vec());
        Ok(String::new())
    });

    (mock, log)
}
