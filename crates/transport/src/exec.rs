//! Transport over a remote shell
//!
//! Every operation is a short POSIX `sh` script run through `ssh` or any
//! command that executes its trailing arguments somewhere else (for example
//! `docker exec -i <container>`). Uses the system ssh so the user's existing
//! ssh config, agent and known hosts apply.
//!
//! Listing relies on GNU `find -printf` on the remote side.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use livesync_core::exclude::STATE_DIR;
use livesync_core::snapshot::{ScanError, ScanErrorKind};
use livesync_core::transport::Op;
use livesync_core::{
    ConnectionStatus, EntryMeta, RelPath, Side, Snapshot, TransportAdapter, TransportError,
};

/// How to reach the machine holding the remote root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteShell {
    /// `ssh -p <port> <user>@<host>`
    Ssh { user: String, host: String, port: u16 },
    /// `<program> <args..> sh -c <script>`
    Exec { program: String, args: Vec<String> },
}

impl RemoteShell {
    /// Parse an `user@host:/path` target into a shell and the remote root
    #[must_use]
    pub fn ssh_target(target: &str, port: u16) -> Option<(Self, String)> {
        let (destination, root) = target.split_once(':')?;
        let (user, host) = destination.split_once('@')?;
        if user.is_empty() || host.is_empty() || root.is_empty() {
            return None;
        }
        let shell = Self::Ssh {
            user: user.to_string(),
            host: host.to_string(),
            port,
        };
        Some((shell, root.to_string()))
    }

    fn command(&self, script: &str) -> Command {
        match self {
            Self::Ssh { user, host, port } => {
                let mut cmd = Command::new("ssh");
                cmd.args([
                    "-p",
                    &port.to_string(),
                    "-o",
                    "BatchMode=yes",
                    "-o",
                    "ConnectTimeout=10",
                    &format!("{user}@{host}"),
                    &format!("sh -c {}", shell_quote(script)),
                ]);
                cmd
            }
            Self::Exec { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args).args(["sh", "-c", script]);
                cmd
            }
        }
    }

    fn is_ssh(&self) -> bool {
        matches!(self, Self::Ssh { .. })
    }
}

impl std::fmt::Display for RemoteShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh { user, host, port } => write!(f, "ssh:{user}@{host}:{port}"),
            Self::Exec { program, args } if args.is_empty() => write!(f, "exec:{program}"),
            Self::Exec { program, args } => write!(f, "exec:{program} {}", args.join(" ")),
        }
    }
}

/// Remote root reached through a [`RemoteShell`]
#[derive(Debug, Clone)]
pub struct ExecTransport {
    shell: RemoteShell,
    root: String,
    timeout: Duration,
}

/// Shell helper that creates one directory, replacing a non-directory in the way
const ENSURE_DIR: &str = r#"ensure_dir() {
  if [ -d "$1" ]; then return 0; fi
  if [ -e "$1" ] || [ -L "$1" ]; then rm -f -- "$1" || return 1; fi
  mkdir -- "$1" || [ -d "$1" ]
}
"#;

impl ExecTransport {
    #[must_use]
    pub fn new(shell: RemoteShell, root: impl Into<String>) -> Self {
        let root = root.into();
        let trimmed = root.trim_end_matches('/');
        let root = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        Self {
            shell,
            root,
            timeout: Duration::from_secs(30),
        }
    }

    /// Upper bound on a single remote command
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn shell(&self) -> &RemoteShell {
        &self.shell
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    fn remote_path(&self, path: &RelPath) -> String {
        if path.is_root() {
            self.root.clone()
        } else if self.root == "/" {
            format!("/{path}")
        } else {
            format!("{}/{path}", self.root)
        }
    }

    /// Lines creating `path` and each missing parent, root first
    fn ensure_dirs_script(&self, path: &RelPath) -> String {
        let mut dirs: Vec<RelPath> = path.ancestors().filter(|p| !p.is_root()).collect();
        dirs.reverse();
        if !path.is_root() {
            dirs.push(path.clone());
        }

        let mut script = format!("mkdir -p -- {}\n", shell_quote(&self.root));
        for dir in dirs {
            script.push_str(&format!(
                "ensure_dir {}\n",
                shell_quote(&self.remote_path(&dir))
            ));
        }
        script
    }

    fn push_script(&self, path: &RelPath) -> String {
        let parents = match path.parent() {
            Some(parent) => self.ensure_dirs_script(&parent),
            None => String::new(),
        };
        format!(
            r#"set -e
{ENSURE_DIR}{parents}target={target}
staging={staging}
mkdir -p -- "$staging"
tmp=$(mktemp "$staging/push.XXXXXX")
trap 'rm -f -- "$tmp"' EXIT
cat > "$tmp"
if [ -f "$target" ] && cmp -s "$tmp" "$target"; then exit 0; fi
chmod 644 "$tmp"
if [ -L "$target" ]; then rm -f -- "$target"; elif [ -d "$target" ]; then rm -rf -- "$target"; fi
mv -f -- "$tmp" "$target"
"#,
            target = shell_quote(&self.remote_path(path)),
            staging = shell_quote(&format!("{}/{STATE_DIR}/tmp", self.root)),
        )
    }

    fn list_script(&self, start: &RelPath) -> String {
        let prune = if start.is_root() {
            format!("-path ./{STATE_DIR} -prune -o ")
        } else {
            String::new()
        };
        format!(
            "[ -d {dir} ] || exit 0\ncd -- {dir} || exit 1\n\
             LC_ALL=C find -L . -mindepth 1 {prune}-printf '%Y\\t%s\\t%T@\\t%P\\0' || true\n",
            dir = shell_quote(&self.remote_path(start)),
        )
    }

    /// Print the single record for `path` in the listing format, or nothing
    /// when it is absent
    fn stat_script(&self, path: &RelPath) -> String {
        format!(
            "[ -d {root} ] || exit 0\ncd -- {root} || exit 1\n\
             [ -e {target} ] || [ -L {target} ] || exit 0\n\
             LC_ALL=C find -L {target} -maxdepth 0 -printf '%Y\\t%s\\t%T@\\t%p\\0' || true\n",
            root = shell_quote(&self.root),
            target = shell_quote(&format!("./{path}")),
        )
    }

    /// Run `script` remotely, feeding `stdin` if given, and classify failures
    async fn run(
        &self,
        op: Op,
        path: &RelPath,
        script: &str,
        stdin: Option<Bytes>,
    ) -> Result<std::process::Output, TransportError> {
        let mut cmd = self.shell.command(script);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let exchange = async {
            let mut child = cmd.spawn().map_err(|e| TransportError::Transient {
                op,
                path: path.clone(),
                message: format!("failed to start {}: {e}", self.shell),
            })?;

            let mut fed = Ok(());
            if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
                fed = pipe.write_all(&data).await;
                drop(pipe);
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| TransportError::from_io(op, path, &e))?;
            Ok::<_, TransportError>((output, fed))
        };

        let (output, fed) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Transient {
                op,
                path: path.clone(),
                message: format!("timed out after {:?}", self.timeout),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(
                op,
                path,
                output.status.code(),
                &stderr,
                self.shell.is_ssh(),
            ));
        }
        if let Err(e) = fed {
            return Err(TransportError::from_io(op, path, &e));
        }
        Ok(output)
    }

    /// Check the remote shell answers at all
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.run(Op::List, &RelPath::root(), "true", None)
            .await
            .map(|_| ())
    }

    /// Ping the remote every `interval` and publish its liveness.
    ///
    /// The task ends once every receiver is dropped.
    #[must_use]
    pub fn spawn_monitor(self: Arc<Self>, interval: Duration) -> watch::Receiver<ConnectionStatus> {
        let (tx, rx) = watch::channel(ConnectionStatus::Connected);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let status = match self.ping().await {
                    Ok(()) => ConnectionStatus::Connected,
                    Err(e) if e.is_transient() => {
                        debug!("Ping of {} failed: {e}", self.shell);
                        ConnectionStatus::Lost
                    }
                    Err(e) => {
                        warn!("Ping of {} failed: {e}", self.shell);
                        ConnectionStatus::Connected
                    }
                };
                tx.send_if_modified(|current| {
                    if *current == status {
                        return false;
                    }
                    info!("Remote {} is now {status:?}", self.shell);
                    *current = status;
                    true
                });
            }
        });
        rx
    }
}

#[async_trait]
impl TransportAdapter for ExecTransport {
    async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError> {
        debug!(%path, bytes = content.len(), "push");
        self.run(Op::Push, path, &self.push_script(path), Some(content))
            .await
            .map(|_| ())
    }

    async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError> {
        let script = format!("cat -- {}", shell_quote(&self.remote_path(path)));
        let output = self.run(Op::Pull, path, &script, None).await?;
        Ok(Bytes::from(output.stdout))
    }

    async fn delete(&self, path: &RelPath) -> Result<(), TransportError> {
        if path.is_root() {
            return Err(TransportError::Other {
                op: Op::Delete,
                path: path.clone(),
                message: "refusing to remove the sync root".into(),
            });
        }
        let script = format!("rm -rf -- {}", shell_quote(&self.remote_path(path)));
        self.run(Op::Delete, path, &script, None).await.map(|_| ())
    }

    async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError> {
        let script = format!("set -e\n{ENSURE_DIR}{}", self.ensure_dirs_script(path));
        self.run(Op::Mkdir, path, &script, None).await.map(|_| ())
    }

    async fn list(&self, root: &RelPath) -> Result<Snapshot, TransportError> {
        let output = self
            .run(Op::List, root, &self.list_script(root), None)
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let listing = parse_listing(root, &output.stdout, &stderr);

        if listing.entries.is_empty() && listing.errors.is_empty() && !stderr.trim().is_empty() {
            return Err(TransportError::Other {
                op: Op::List,
                path: root.clone(),
                message: stderr.trim().to_string(),
            });
        }
        for line in &listing.unparsed {
            warn!("Unrecognised listing output from {}: {line}", self.shell);
        }
        Ok(Snapshot::from_parts(
            Side::Remote,
            listing.entries,
            listing.errors,
        ))
    }

    async fn stat(&self, path: &RelPath) -> Result<Option<EntryMeta>, TransportError> {
        let output = self
            .run(Op::List, path, &self.stat_script(path), None)
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        // A dangling link is reported as an error, which reads as absent here
        let mut listing = parse_listing(&RelPath::root(), &output.stdout, &stderr);
        Ok(listing.entries.remove(path))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.shell, self.root)
    }
}

/// Quote `s` as a single `sh` word
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Map a failed remote command to a transport error
fn classify(op: Op, path: &RelPath, code: Option<i32>, stderr: &str, ssh: bool) -> TransportError {
    let path = path.clone();
    let message = stderr.trim().to_string();

    // ssh itself exits 255 when the connection fails
    if code.is_none() || (ssh && code == Some(255)) {
        return TransportError::Transient { op, path, message };
    }
    if message.contains("Permission denied") || message.contains("Read-only file system") {
        return TransportError::PermissionDenied { path, message };
    }
    if message.contains("No space left") || message.contains("Disk quota") {
        return TransportError::QuotaExceeded { path, message };
    }
    if message.contains("No such file") {
        return TransportError::NotFound { path };
    }

    let message = if message.is_empty() {
        format!("exit status {}", code.unwrap_or(-1))
    } else {
        message
    };
    TransportError::Other { op, path, message }
}

#[derive(Debug, Default)]
struct Listing {
    entries: BTreeMap<RelPath, EntryMeta>,
    errors: Vec<ScanError>,
    unparsed: Vec<String>,
}

/// Parse `find -printf '%Y\t%s\t%T@\t%P\0'` output and its diagnostics
fn parse_listing(start: &RelPath, stdout: &[u8], stderr: &str) -> Listing {
    let mut listing = Listing::default();
    let locate = |name: &str| {
        if start.is_root() {
            RelPath::new(name)
        } else {
            RelPath::new(&format!("{start}/{name}"))
        }
    };

    for record in stdout.split(|&b| b == 0).filter(|r| !r.is_empty()) {
        let record = String::from_utf8_lossy(record);
        let mut fields = record.splitn(4, '\t');
        let (Some(kind), Some(size), Some(mtime), Some(name)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            listing.unparsed.push(record.into_owned());
            continue;
        };
        let Ok(path) = locate(name) else {
            listing.unparsed.push(record.into_owned());
            continue;
        };

        match kind {
            "f" => {
                let size = size.parse().unwrap_or(0);
                listing
                    .entries
                    .insert(path, EntryMeta::file(size, parse_mtime(mtime), None));
            }
            "d" => {
                listing.entries.insert(path, EntryMeta::dir());
            }
            "N" => listing.errors.push(ScanError {
                path,
                kind: ScanErrorKind::NotFound,
                message: "dangling symlink".into(),
            }),
            "L" => listing.errors.push(ScanError {
                path,
                kind: ScanErrorKind::Other,
                message: "symlink loop".into(),
            }),
            "?" => listing.errors.push(ScanError {
                path,
                kind: ScanErrorKind::Other,
                message: "cannot stat".into(),
            }),
            // sockets, fifos and devices are not synced
            _ => {}
        }
    }

    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        match parse_find_error(line) {
            Some((name, message)) => match locate(name) {
                Ok(path) => {
                    let kind = if message.contains("Permission denied") {
                        ScanErrorKind::PermissionDenied
                    } else if message.contains("No such file") {
                        ScanErrorKind::NotFound
                    } else {
                        ScanErrorKind::Other
                    };
                    listing.errors.push(ScanError {
                        path,
                        kind,
                        message: message.to_string(),
                    });
                }
                Err(_) => listing.unparsed.push(line.to_string()),
            },
            None => listing.unparsed.push(line.to_string()),
        }
    }
    listing
}

/// Split `find: './a/b': Permission denied` into `a/b` and the message
fn parse_find_error(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("find: '")?;
    let (quoted, message) = rest.split_once("': ")?;
    let name = quoted.strip_prefix("./")?;
    Some((name, message))
}

/// Parse `find`'s `%T@` (seconds since the epoch with a fraction)
fn parse_mtime(raw: &str) -> Option<SystemTime> {
    let (secs, frac) = raw.split_once('.').unwrap_or((raw, ""));
    let secs: u64 = secs.parse().ok()?;
    let digits: String = frac
        .chars()
        .take_while(char::is_ascii_digit)
        .chain(std::iter::repeat('0'))
        .take(9)
        .collect();
    let nanos: u32 = digits.parse().ok()?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}
