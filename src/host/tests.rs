use super::*;
use crate::configuration::tests::target_with_retention;
use crate::connection::MockConnection;
use crate::test_support::{
    list_output, mutations, recording_connection, routed_connection, strs, CallLog, MOUNT_OUTPUT,
};

const SNAP_DIR: &str = "/opt/.b4_backup/snapshots/localhost/home";
const DST_SNAP_DIR: &str = "/opt/b4/snapshots/localhost/home";

fn home_target() -> TargetConfig {
    let mut target = target_with_retention(&[], &[]);
    target.source = "/opt/home".to_string();
    target.destination = Some("/opt/b4".to_string());
    target.ignored_subvolumes = vec![PathBuf::from("test/ignored")];

    target
}

fn src_host(subvolume_list: String) -> (BackupTargetHost, CallLog) {
    src_host_with(subvolume_list, Vec::new(), Vec::new())
}

fn src_host_with(
    subvolume_list: String,
    listings: Vec<(String, String)>,
    missing: Vec<String>,
) -> (BackupTargetHost, CallLog) {
    let (mock, log) = routed_connection("/opt/home", subvolume_list, listings, missing);
    let host =
        BackupTargetHost::from_source_host("localhost/home", home_target(), Box::new(mock))
            .unwrap();

    (host, log)
}

fn dst_host(subvolume_list: String) -> (BackupTargetHost, CallLog) {
    let (mock, log) = routed_connection("/opt/b4", subvolume_list, Vec::new(), Vec::new());
    let host =
        BackupTargetHost::from_destination_host("localhost/home", home_target(), Box::new(mock))
            .unwrap();

    (host, log)
}

#[test]
fn from_source_host_computes_paths() {
    let (host, log) = src_host(String::new());

    assert_eq!(host.role, HostRole::Source);
    assert_eq!(host.mount_point(), Path::new("/opt"));
    assert_eq!(host.snapshot_dir, PathBuf::from(SNAP_DIR));
    assert_eq!(host.target_path, PathBuf::from("/opt/home"));
    assert_eq!(
        host.replace_dir(),
        PathBuf::from("/opt/.b4_backup/replace/localhost/home")
    );
    assert_eq!(log.lock().unwrap().as_slice(), &[strs(&["mount"])]);
}

#[test]
fn from_destination_host_computes_paths() {
    let (host, _) = dst_host(String::new());

    assert_eq!(host.role, HostRole::Destination);
    assert_eq!(host.snapshot_dir, PathBuf::from(DST_SNAP_DIR));
    assert_eq!(host.target_path, PathBuf::from("/opt/b4"));
}

#[test]
fn from_destination_host_missing_directory() {
    let (mock, _) = routed_connection(
        "/idontexist",
        String::new(),
        Vec::new(),
        vec!["/idontexist".to_string()],
    );

    let result =
        BackupTargetHost::from_destination_host("localhost/home", home_target(), Box::new(mock));

    assert!(matches!(
        result,
        Err(BackupError::DestinationDirectoryNotFound(_))
    ));
}

#[test]
fn mount_point_prefers_longest_match() {
    let mut mock = MockConnection::new();
    mock.expect_location()
        .return_const(PathBuf::from("/opt/home"));
    mock.expect_run_process().returning(|_| {
        Ok("/dev/sda4 on / type btrfs (rw)\n\
            /dev/sda3 on /opt type btrfs (rw,relatime)\n"
            .to_string())
    });

    let result = BackupTargetHost::resolve_mount_point(&mock).unwrap();

    assert_eq!(result, PathBuf::from("/opt"));
}

#[test]
fn mount_point_not_found() {
    let mut mock = MockConnection::new();
    mock.expect_location()
        .return_const(PathBuf::from("/opt/home"));
    mock.expect_run_process().returning(|_| {
        Ok("/dev/sda1 on /boot type ext4 (rw,relatime)\n\
            /dev/sda3 on /idontexist type btrfs (rw,relatime)\n"
            .to_string())
    });

    assert!(matches!(
        BackupTargetHost::resolve_mount_point(&mock),
        Err(BackupError::BtrfsPartitionNotFound(_))
    ));
}

#[test]
fn subvolumes_lists_mount_point_first() {
    let (host, _) = src_host(list_output(&["home", "home/alpha/bravo"]));

    let result = host.subvolumes().unwrap();

    assert_eq!(
        result,
        vec![
            PathBuf::from("/opt"),
            PathBuf::from("/opt/home"),
            PathBuf::from("/opt/home/alpha/bravo"),
        ]
    );
}

#[test]
fn snapshots_groups_by_first_component() {
    let (host, _) = src_host(list_output(&[
        ".b4_backup/snapshots/localhost/home/alpha/!",
        ".b4_backup/snapshots/localhost/home/alpha/!test",
        ".b4_backup/snapshots/localhost/home/bravo/!",
        "home",
    ]));

    let result = host.snapshots().unwrap();

    assert_eq!(
        result,
        BTreeMap::from([
            (
                "alpha".to_string(),
                Snapshot {
                    name: "alpha".to_string(),
                    base_path: PathBuf::from(SNAP_DIR),
                    subvolumes: vec![PathBuf::from("!"), PathBuf::from("!test")],
                }
            ),
            (
                "bravo".to_string(),
                Snapshot {
                    name: "bravo".to_string(),
                    base_path: PathBuf::from(SNAP_DIR),
                    subvolumes: vec![PathBuf::from("!")],
                }
            ),
        ])
    );
}

#[test]
fn create_snapshot_filters_ignored_and_escapes() {
    let (host, log) = src_host(list_output(&[
        "home",
        "home/test/.steam",
        "home/test/ignored/subvol",
        "home/test/pictures",
    ]));

    let result = host.create_snapshot("1").unwrap();

    assert_eq!(
        mutations(&log),
        vec![
            strs(&["mkdir", &format!("{}/1", SNAP_DIR), "-p"]),
            strs(&[
                "btrfs",
                "subvolume",
                "snapshot",
                "-r",
                "/opt/home",
                &format!("{}/1/!", SNAP_DIR),
            ]),
            strs(&[
                "btrfs",
                "subvolume",
                "snapshot",
                "-r",
                "/opt/home/test/.steam",
                &format!("{}/1/!test!.steam", SNAP_DIR),
            ]),
            strs(&[
                "btrfs",
                "subvolume",
                "snapshot",
                "-r",
                "/opt/home/test/pictures",
                &format!("{}/1/!test!pictures", SNAP_DIR),
            ]),
        ]
    );
    assert_eq!(
        result,
        Snapshot {
            name: "1".to_string(),
            base_path: PathBuf::from(SNAP_DIR),
            subvolumes: vec![
                PathBuf::from("!"),
                PathBuf::from("!test!.steam"),
                PathBuf::from("!test!pictures"),
            ],
        }
    );
}

#[test]
fn create_snapshot_without_live_subvolumes() {
    let (host, _) = src_host(String::new());

    assert!(matches!(
        host.create_snapshot("1"),
        Err(BackupError::BtrfsSubvolumeNotFound(_))
    ));
}

#[test]
fn delete_snapshot_full_removes_root_marker_first() {
    let (host, log) = src_host(String::new());
    let snapshot = Snapshot {
        name: "alpha".to_string(),
        base_path: PathBuf::from(SNAP_DIR),
        subvolumes: vec![PathBuf::from("!"), PathBuf::from("!a"), PathBuf::from("!b")],
    };

    host.delete_snapshot(&snapshot, None).unwrap();

    assert_eq!(
        mutations(&log),
        vec![
            strs(&["btrfs", "subvolume", "delete", &format!("{}/alpha/!", SNAP_DIR)]),
            strs(&["btrfs", "subvolume", "delete", &format!("{}/alpha/!a", SNAP_DIR)]),
            strs(&["btrfs", "subvolume", "delete", &format!("{}/alpha/!b", SNAP_DIR)]),
            strs(&["rmdir", &format!("{}/alpha", SNAP_DIR)]),
        ]
    );
}

#[test]
fn delete_snapshot_subset_leaves_directory() {
    let (host, log) = src_host(String::new());
    let snapshot = Snapshot {
        name: "alpha".to_string(),
        base_path: PathBuf::from(SNAP_DIR),
        subvolumes: vec![PathBuf::from("!"), PathBuf::from("!a"), PathBuf::from("!b")],
    };

    host.delete_snapshot(&snapshot, Some(&[PathBuf::from("!a")]))
        .unwrap();

    assert_eq!(
        mutations(&log),
        vec![strs(&[
            "btrfs",
            "subvolume",
            "delete",
            &format!("{}/alpha/!a", SNAP_DIR),
        ])]
    );
}

#[test]
fn delete_snapshot_empty_subset_is_noop() {
    let (host, log) = src_host(String::new());
    let snapshot = Snapshot {
        name: "alpha".to_string(),
        base_path: PathBuf::from(SNAP_DIR),
        subvolumes: vec![PathBuf::from("!")],
    };

    host.delete_snapshot(&snapshot, Some(&[])).unwrap();

    assert!(mutations(&log).is_empty());
}

fn src_inventory() -> String {
    list_output(&[
        "home",
        ".b4_backup/snapshots/localhost/home/alpha/!",
        ".b4_backup/snapshots/localhost/home/alpha/!b",
        ".b4_backup/snapshots/localhost/home/alpha/!b!a",
        ".b4_backup/snapshots/localhost/home/bravo/!",
        ".b4_backup/snapshots/localhost/home/bravo/!b",
        ".b4_backup/snapshots/localhost/home/bravo/!b!a",
    ])
}

fn dst_inventory() -> String {
    list_output(&[
        "b4/snapshots/localhost/home/alpha/!",
        "b4/snapshots/localhost/home/alpha/!b",
        "b4/snapshots/localhost/home/alpha/!b!a",
    ])
}

#[test]
fn send_snapshot_already_present_is_noop() {
    let (src, _) = src_host(src_inventory());
    let (dst, dst_log) = dst_host(dst_inventory());
    let (send, send_log) = recording_connection();

    src.send_snapshot(&dst, "alpha", &send, true).unwrap();

    assert!(mutations(&dst_log).is_empty());
    assert!(send_log.lock().unwrap().is_empty());
}

#[test]
fn send_snapshot_incremental_uses_parent() {
    let (src, _) = src_host(src_inventory());
    let (dst, dst_log) = dst_host(dst_inventory());
    let (send, send_log) = recording_connection();

    src.send_snapshot(&dst, "bravo", &send, true).unwrap();

    assert_eq!(
        mutations(&dst_log),
        vec![strs(&["mkdir", &format!("{}/bravo", DST_SNAP_DIR), "-p"])]
    );
    assert_eq!(
        send_log.lock().unwrap().as_slice(),
        &[
            strs(&[
                "bash",
                "-c",
                "btrfs send -p '/opt/.b4_backup/snapshots/localhost/home/alpha/!' '/opt/.b4_backup/snapshots/localhost/home/bravo/!' | btrfs receive /opt/b4/snapshots/localhost/home/bravo",
            ]),
            strs(&[
                "bash",
                "-c",
                "btrfs send -p '/opt/.b4_backup/snapshots/localhost/home/alpha/!b' '/opt/.b4_backup/snapshots/localhost/home/bravo/!b' | btrfs receive /opt/b4/snapshots/localhost/home/bravo",
            ]),
            strs(&[
                "bash",
                "-c",
                "btrfs send -p '/opt/.b4_backup/snapshots/localhost/home/alpha/!b!a' '/opt/.b4_backup/snapshots/localhost/home/bravo/!b!a' | btrfs receive /opt/b4/snapshots/localhost/home/bravo",
            ]),
        ]
    );
}

#[test]
fn send_snapshot_full() {
    let (src, _) = src_host(src_inventory());
    let (dst, _) = dst_host(dst_inventory());
    let (send, send_log) = recording_connection();

    src.send_snapshot(&dst, "bravo", &send, false).unwrap();

    assert_eq!(
        send_log.lock().unwrap().as_slice(),
        &[
            strs(&[
                "bash",
                "-c",
                "btrfs send '/opt/.b4_backup/snapshots/localhost/home/bravo/!' | btrfs receive /opt/b4/snapshots/localhost/home/bravo",
            ]),
            strs(&[
                "bash",
                "-c",
                "btrfs send '/opt/.b4_backup/snapshots/localhost/home/bravo/!b' | btrfs receive /opt/b4/snapshots/localhost/home/bravo",
            ]),
            strs(&[
                "bash",
                "-c",
                "btrfs send '/opt/.b4_backup/snapshots/localhost/home/bravo/!b!a' | btrfs receive /opt/b4/snapshots/localhost/home/bravo",
            ]),
        ]
    );
}

#[test]
fn send_snapshot_missing_source_snapshot() {
    let (src, _) = src_host(String::new());
    let (dst, _) = dst_host(String::new());
    let (send, _) = recording_connection();

    assert!(matches!(
        src.send_snapshot(&dst, "idontexist", &send, true),
        Err(BackupError::SnapshotNotFound(_))
    ));
}

#[test]
fn send_snapshot_remote_destination_gets_prefix() {
    let (src, _) = src_host(src_inventory());

    let mut mock = MockConnection::new();
    mock.expect_location().return_const(PathBuf::from("/opt/b4"));
    mock.expect_is_remote().return_const(true);
    mock.expect_exec_prefix()
        .return_const("ssh -p 22 root@backup.example.com ".to_string());
    mock.expect_run_process().returning(|argv| {
        let argv_strs: Vec<&str> = argv.iter().map(String::as_str).collect();
        match argv_strs.as_slice() {
            ["mount"] => Ok(MOUNT_OUTPUT.to_string()),
            ["btrfs", "subvolume", "list", _] => Ok(String::new()),
            _ => Ok(String::new()),
        }
    });
    let dst =
        BackupTargetHost::from_destination_host("localhost/home", home_target(), Box::new(mock))
            .unwrap();

    let (send, send_log) = recording_connection();
    src.send_snapshot(&dst, "bravo", &send, false).unwrap();

    let commands = send_log.lock().unwrap();
    assert!(commands[0][2].contains(
        "| ssh -p 22 root@backup.example.com btrfs receive /opt/b4/snapshots/localhost/home/bravo"
    ));
}

#[test]
fn nearest_matching_snapshot_cases() {
    let cases: [(&str, &[&str], &[&str], Option<&str>); 4] = [
        ("3", &["1", "2", "3"], &["1", "2"], Some("2")),
        ("3", &["1", "2", "3"], &["4", "5"], None),
        ("3", &[], &[], None),
        ("3", &["3", "4", "5"], &["4", "5"], Some("4")),
    ];

    for (name, source, destination, expect) in cases {
        let source: BTreeSet<String> = source.iter().map(|s| s.to_string()).collect();
        let destination: BTreeSet<String> =
            destination.iter().map(|s| s.to_string()).collect();

        assert_eq!(
            BackupTargetHost::nearest_matching_snapshot(name, &source, &destination),
            expect.map(String::from),
            "{} {:?} {:?}",
            name,
            source,
            destination
        );
    }
}

#[test]
fn remove_empty_dirs_skips_subvolumes() {
    let (host, log) = src_host_with(
        list_output(&[".b4_backup/snapshots/localhost/home/bravo/!"]),
        vec![
            (SNAP_DIR.to_string(), "alpha\nbravo\n".to_string()),
            (format!("{}/alpha", SNAP_DIR), String::new()),
            (format!("{}/bravo", SNAP_DIR), "!\n".to_string()),
        ],
        Vec::new(),
    );

    let empty = host.remove_empty_dirs(Path::new(SNAP_DIR)).unwrap();

    assert!(!empty);
    assert_eq!(
        mutations(&log),
        vec![strs(&["rmdir", &format!("{}/alpha", SNAP_DIR)])]
    );
}

#[test]
fn source_subvolumes_from_snapshot_drops_root_marker() {
    let (host, _) = src_host(String::new());
    let snapshot = Snapshot {
        name: "alpha_test".to_string(),
        base_path: PathBuf::from(SNAP_DIR),
        subvolumes: vec![PathBuf::from("!"), PathBuf::from("!test")],
    };

    assert_eq!(
        host.source_subvolumes_from_snapshot(&snapshot),
        vec![PathBuf::from("!test")]
    );
}

fn generator_config() -> BaseConfig {
    let mut home = home_target();
    home.source = "/opt/home".to_string();

    let mut root = home_target();
    root.source = "/opt/root".to_string();
    root.destination = Some("/opt/missing".to_string());
    root.on_destination_dir_missing = OnDestinationDirMissing::Skip;

    BaseConfig {
        timezone: "utc".to_string(),
        default_targets: Vec::new(),
        backup_targets: BTreeMap::from([
            ("localhost/home".to_string(), home),
            ("localhost/root".to_string(), root),
        ]),
    }
}

fn generator_connect(url: &str) -> Result<Box<dyn Connection>, BackupError> {
    let missing = match url {
        "/opt/missing" => vec!["/opt/missing".to_string()],
        _ => Vec::new(),
    };
    let (mock, _) = routed_connection(url, String::new(), Vec::new(), missing);

    Ok(Box::new(mock))
}

#[test]
fn host_generator_builds_pairs() {
    let config = generator_config();
    let choice = ChoiceSelector::new(["."]);

    let result = host_generator_with(&choice, &config, false, &generator_connect);

    assert_eq!(result.len(), 2);

    let (name, pair) = &result[0];
    assert_eq!(name, "localhost/home");
    let (source, destination) = pair.as_ref().unwrap();
    assert_eq!(source.role, HostRole::Source);
    assert_eq!(destination.as_ref().unwrap().role, HostRole::Destination);

    // missing destination directory with SKIP yields no destination host
    let (name, pair) = &result[1];
    assert_eq!(name, "localhost/root");
    let (_, destination) = pair.as_ref().unwrap();
    assert!(destination.is_none());
}

#[test]
fn host_generator_offline_skips_destinations() {
    let config = generator_config();
    let choice = ChoiceSelector::new(["localhost/home"]);

    let result = host_generator_with(&choice, &config, true, &generator_connect);

    assert_eq!(result.len(), 1);
    let (_, pair) = &result[0];
    assert!(pair.as_ref().unwrap().1.is_none());
}

#[test]
fn host_generator_reports_per_target_errors() {
    let mut config = generator_config();
    config
        .backup_targets
        .get_mut("localhost/home")
        .unwrap()
        .source = "xyz://example.com/data".to_string();

    let connect = |url: &str| -> Result<Box<dyn Connection>, BackupError> {
        match url.starts_with("xyz://") {
            true => Err(BackupError::UnknownProtocol("xyz".to_string())),
            false => generator_connect(url),
        }
    };

    let result = host_generator_with(&ChoiceSelector::new(["."]), &config, true, &connect);

    assert!(result[0].1.is_err());
    assert!(result[1].1.is_ok());
}
