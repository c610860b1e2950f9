use std::path::{Path, PathBuf};

/// Escaped name of the subvolume standing for the target root itself.
pub const ROOT_MARKER: &str = "!";

/// Escape a path relative to the target root into a single directory entry.
///
/// Every `/` becomes `!` and the result is prefixed with `!`, so the empty
/// relative path (the target root) encodes as a single `!`. Escaped names can
/// therefore never collide with real subdirectories of a snapshot.
///
/// * `path` - relative path to encode
///
pub fn escape_path(path: &Path) -> String {
    let mut escaped = String::from(ROOT_MARKER);
    escaped.push_str(&path.to_string_lossy().replace('/', "!"));

    escaped
}

/// Invert [`escape_path`].
pub fn unescape_path(name: &str) -> PathBuf {
    let name = name.strip_prefix('!').unwrap_or(name);

    PathBuf::from(name.replace('!', "/"))
}

/// A point-in-time snapshot of one backup target: a named directory holding
/// one read-only subvolume per live subvolume of the target tree.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Snapshot {
    /// `YYYY-MM-DD-HH-MM-SS` optionally followed by `_<retention_name>`.
    pub name: String,
    /// Directory under which the per-snapshot directory lives.
    pub base_path: PathBuf,
    /// Paths of the member subvolumes relative to `base_path/name`, in
    /// discovery order. For snapshots created by this tool these are escaped
    /// single components, the root marker first.
    pub subvolumes: Vec<PathBuf>,
}

impl Snapshot {
    /// Directory holding the snapshot's subvolumes.
    pub fn path(&self) -> PathBuf {
        self.base_path.join(&self.name)
    }

    /// Absolute path of one member subvolume. An empty relative path denotes
    /// the snapshot directory itself.
    pub fn subvolume_path(&self, subvolume: &Path) -> PathBuf {
        match subvolume.as_os_str().is_empty() {
            true => self.path(),
            false => self.path().join(subvolume),
        }
    }

    /// The member subvolumes with the escaping removed, i.e. the paths they
    /// had relative to the target root.
    pub fn subvolumes_unescaped(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.subvolumes
            .iter()
            .map(|subvolume| unescape_path(&subvolume.to_string_lossy()))
    }

    /// Whether the given member is the root marker.
    pub fn is_root_marker(subvolume: &Path) -> bool {
        subvolume.as_os_str() == ROOT_MARKER
    }
}
