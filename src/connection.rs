use crate::backup_error::BackupError;
use log::{debug, trace};
use std::path::{Path, PathBuf};
use std::process;

#[cfg(test)]
mod tests;

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A parsed connection URL.
///
/// Accepted forms are `ssh://[user[:password]@]host[:port]/absolute/path`
/// and a bare filesystem path.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Url {
    pub protocol: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub location: PathBuf,
}

impl Url {
    /// Parse a connection URL.
    ///
    /// * `url` - URL string or bare path
    ///
    pub fn from_url(url: &str) -> Result<Self, BackupError> {
        if url.is_empty() {
            return Err(BackupError::InvalidConnectionUrl(url.to_string()));
        }

        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, url),
        };

        let Some(scheme) = scheme else {
            // A bare path. Host-like syntax without a scheme is rejected
            // rather than silently treated as a directory name.
            let first_segment = rest.split('/').next().unwrap_or(rest);
            if first_segment.contains('@') || first_segment.contains(':') {
                return Err(BackupError::InvalidConnectionUrl(url.to_string()));
            }

            return Ok(Url {
                protocol: None,
                user: DEFAULT_USER.to_string(),
                password: None,
                host: None,
                port: 0,
                location: PathBuf::from(rest),
            });
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, format!("/{}", path)),
            None => (rest, "/".to_string()),
        };

        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => (Some(userinfo), host_port),
            None => (None, authority),
        };

        let (user, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, password)) => (user.to_string(), Some(password.to_string())),
                None => (userinfo.to_string(), None),
            },
            None => (DEFAULT_USER.to_string(), None),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| BackupError::InvalidConnectionUrl(url.to_string()))?,
            ),
            None => (host_port, DEFAULT_SSH_PORT),
        };

        if host.is_empty() {
            return Err(BackupError::InvalidConnectionUrl(url.to_string()));
        }

        Ok(Url {
            protocol: Some(scheme.to_string()),
            user,
            password,
            host: Some(host.to_string()),
            port,
            location: PathBuf::from(path),
        })
    }
}

/// Runs command pipelines on one host, local or remote.
///
/// `run_process` returns the command's standard output; a non-zero exit
/// status becomes [`BackupError::FailedProcess`] carrying the full
/// diagnostics. The provided directory helpers are all composed from
/// `run_process` so they behave identically on every transport.
pub trait Connection {
    /// Run a command and return its standard output.
    ///
    /// * `argv` - command and arguments
    ///
    fn run_process(&self, argv: &[String]) -> Result<String, BackupError>;

    /// Prefix used to compose piped commands that cross hosts. Empty for a
    /// local connection, `ssh -p <port> <user>@<host> ` for ssh.
    fn exec_prefix(&self) -> String;

    /// Directory this connection points at.
    fn location(&self) -> PathBuf;

    fn is_remote(&self) -> bool;

    fn mkdir_p(&self, path: &Path) -> Result<(), BackupError> {
        self.run_process(&[
            "mkdir".to_string(),
            path.to_string_lossy().into_owned(),
            "-p".to_string(),
        ])
        .map(|_| ())
    }

    /// Remove a directory, treating an already missing one as removed.
    fn rmdir(&self, path: &Path) -> Result<(), BackupError> {
        match self.run_process(&["rmdir".to_string(), path.to_string_lossy().into_owned()]) {
            Ok(_) => Ok(()),
            Err(error) if error.is_missing_file() => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn path_exists(&self, path: &Path) -> Result<bool, BackupError> {
        match self.run_process(&[
            "ls".to_string(),
            "-d".to_string(),
            path.to_string_lossy().into_owned(),
        ]) {
            Ok(_) => Ok(true),
            Err(error) if error.is_missing_file() => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), BackupError> {
        self.run_process(&[
            "mv".to_string(),
            from.to_string_lossy().into_owned(),
            to.to_string_lossy().into_owned(),
        ])
        .map(|_| ())
    }

    /// List the entries of a directory. A missing directory yields an empty
    /// listing.
    fn iterdir(&self, path: &Path) -> Result<Vec<PathBuf>, BackupError> {
        let output =
            match self.run_process(&["ls".to_string(), path.to_string_lossy().into_owned()]) {
                Ok(output) => output,
                Err(error) if error.is_missing_file() => return Ok(Vec::new()),
                Err(error) => return Err(error),
            };

        Ok(output
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| path.join(line))
            .collect())
    }
}

/// Executes commands on the local host.
#[derive(Debug, Default, Clone)]
pub struct LocalConnection {
    location: PathBuf,
}

impl LocalConnection {
    pub fn new(location: PathBuf) -> Self {
        LocalConnection { location }
    }
}

impl Connection for LocalConnection {
    fn run_process(&self, argv: &[String]) -> Result<String, BackupError> {
        trace!("running local command: {:?}", argv);

        let output = process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(process::Stdio::null())
            .output()?;

        check_output(argv, &output)
    }

    fn exec_prefix(&self) -> String {
        String::new()
    }

    fn location(&self) -> PathBuf {
        self.location.clone()
    }

    fn is_remote(&self) -> bool {
        false
    }
}

/// Executes commands on a remote host through the ssh client.
///
/// With `keep_open` set, commands share one multiplexed master connection
/// instead of opening a new session per command. Authentication relies on
/// keys; a password in the URL is carried along for completeness only.
#[derive(Debug, Clone)]
pub struct SshConnection {
    user: String,
    host: String,
    port: u16,
    location: PathBuf,
    keep_open: bool,
}

impl SshConnection {
    pub fn from_url(url: &Url) -> Result<Self, BackupError> {
        let host = url.host.clone().ok_or_else(|| {
            BackupError::InvalidConnectionUrl("ssh url without a host".to_string())
        })?;

        Ok(SshConnection {
            user: url.user.clone(),
            host,
            port: url.port,
            location: url.location.clone(),
            keep_open: false,
        })
    }

    /// Keep the underlying ssh connection established across commands for
    /// the rest of this connection's lifetime.
    pub fn set_keep_open(&mut self, keep_open: bool) {
        self.keep_open = keep_open;
    }

    fn ssh_argv(&self, command: &str) -> Vec<String> {
        let mut argv = vec!["ssh".to_string(), "-p".to_string(), self.port.to_string()];

        if self.keep_open {
            argv.extend([
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                "ControlPath=~/.ssh/b4-backup-%C".to_string(),
                "-o".to_string(),
                "ControlPersist=60".to_string(),
            ]);
        }

        argv.push(format!("{}@{}", self.user, self.host));
        argv.push(command.to_string());

        argv
    }
}

impl Connection for SshConnection {
    fn run_process(&self, argv: &[String]) -> Result<String, BackupError> {
        let command = shell_join(argv);
        let ssh_argv = self.ssh_argv(&command);

        debug!("running remote command on {}: {}", self.host, command);

        let output = process::Command::new(&ssh_argv[0])
            .args(&ssh_argv[1..])
            .stdin(process::Stdio::null())
            .output()?;

        check_output(&ssh_argv, &output)
    }

    fn exec_prefix(&self) -> String {
        format!("ssh -p {} {}@{} ", self.port, self.user, self.host)
    }

    fn location(&self) -> PathBuf {
        self.location.clone()
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Build a connection from a URL string.
///
/// * `url` - ssh URL or local path
///
pub fn connection_from_url(url: &str) -> Result<Box<dyn Connection>, BackupError> {
    let parsed = Url::from_url(url)?;

    match parsed.protocol.as_deref() {
        None => Ok(Box::new(LocalConnection::new(parsed.location.clone()))),
        Some("ssh") => Ok(Box::new(SshConnection::from_url(&parsed)?)),
        Some(protocol) => Err(BackupError::UnknownProtocol(protocol.to_string())),
    }
}

fn check_output(argv: &[String], output: &process::Output) -> Result<String, BackupError> {
    match output.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        Some(_) => Err(BackupError::FailedProcess {
            argv: argv.to_vec(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        None => Err(BackupError::FailedProcess {
            argv: argv.to_vec(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: "process was terminated by a signal".to_string(),
        }),
    }
}

/// Join an argument vector into a single shell command line, quoting where
/// needed.
pub(crate) fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./:=@%+,!".contains(c);

    if !arg.is_empty() && arg.chars().all(safe) {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mockall::mock! {
    pub Connection {}

    impl Connection for Connection {
        fn run_process(&self, argv: &[String]) -> Result<String, BackupError>;
        fn exec_prefix(&self) -> String;
        fn location(&self) -> PathBuf;
        fn is_remote(&self) -> bool;
    }
}
