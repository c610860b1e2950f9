use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid connection url: {0}")]
    InvalidConnectionUrl(String),
    #[error("unknown protocol \"{0}\", supported protocols are ssh and local paths")]
    UnknownProtocol(String),
    #[error("destination directory {0} does not exist")]
    DestinationDirectoryNotFound(PathBuf),
    #[error("no btrfs partition found containing {0}")]
    BtrfsPartitionNotFound(PathBuf),
    #[error("no btrfs subvolume left to snapshot under {0}")]
    BtrfsSubvolumeNotFound(PathBuf),
    #[error("snapshot \"{0}\" not found")]
    SnapshotNotFound(String),
    #[error(
        "process {argv:?} exited with a non-zero error code\nSTDOUT: {stdout}\nSTDERR: {stderr}"
    )]
    FailedProcess {
        argv: Vec<String>,
        stdout: String,
        stderr: String,
    },
    #[error("invalid retention rule: {0}")]
    InvalidRetentionRule(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    TargetErrors(TargetErrors),
}

/// Per-target errors collected during multi-target commands so one failing
/// target does not abort the rest.
#[derive(Debug, Default)]
pub struct TargetErrors(pub Vec<(String, BackupError)>);

impl TargetErrors {
    pub fn push(&mut self, target: &str, error: BackupError) {
        self.0.push((target.to_string(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), BackupError> {
        match self.is_empty() {
            true => Ok(()),
            false => Err(BackupError::TargetErrors(self)),
        }
    }
}

impl std::fmt::Display for TargetErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} target(s) failed:", self.0.len())?;

        for (target, error) in &self.0 {
            writeln!(f, "  {}: {}", target, error)?;
        }

        Ok(())
    }
}

impl BackupError {
    /// Whether this is a failed process whose stderr reports a missing file,
    /// which several directory operations treat as a no-op.
    pub fn is_missing_file(&self) -> bool {
        match self {
            BackupError::FailedProcess { stderr, .. } => {
                stderr.contains("No such file or directory")
            }
            _ => false,
        }
    }
}
