//! livesync: Keep a local tree mirrored into a remote environment
//!
//! - Initial sync with a local-authoritative or merge policy
//! - Continuous two-way propagation with echo suppression
//! - Local directory, ssh or any exec-style remote shell as target
//! - Exclusion rules from `.livesync.toml` and the command line

mod debug_log;
mod progress;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use livesync_core::{
    ConnectionStatus, EntryKind, ExclusionMatcher, ExclusionRule, InitialPolicy, LivesyncConfig,
    Scanner, SessionState, Snapshot, SyncOptions, SyncOrchestrator, SyncRoot, TransportAdapter,
};
use livesync_transport::{ExecTransport, LocalTransport, RemoteShell};

use progress::{Status, SyncProgress, print_status, print_warning};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

/// How often a remote shell target is pinged while watching
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Entries listed by `scan` before it switches to totals only
const SCAN_LISTING_LIMIT: usize = 20;

#[derive(Parser)]
#[command(name = "livesync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Mirror a local tree into a running remote environment")]
#[command(long_about = r#"
livesync keeps a local source tree and a remote copy converged while you work.

Edits on either side propagate to the other. On conflict the local version
wins. Paths matched by exclusion rules never leave the machine they are on.

Targets:
  --to-dir DIR                 Another directory on this machine
  --ssh user@host:/path        A remote host over the system ssh
  --remote-root PATH -- CMD..  Anything that runs commands, e.g. a container

Examples:
  livesync sync ./site --ssh dev@box:/srv/site
  livesync watch ./site --remote-root /app -- docker exec -i web
  livesync scan ./site -x node_modules/
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the remote in line with the local tree once
    Sync {
        /// Local directory path
        local: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Additional exclusion pattern, anchored at the root
        #[arg(short = 'x', long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        /// What to do with entries that only exist on the remote
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
    },

    /// Sync, then keep both sides converged until interrupted
    Watch {
        /// Local directory path
        local: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Additional exclusion pattern, anchored at the root
        #[arg(short = 'x', long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        /// What to do with entries that only exist on the remote
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Debounce window for local changes in milliseconds
        #[arg(short, long, value_name = "MS")]
        debounce: Option<u64>,

        /// Remote polling interval in milliseconds
        #[arg(long, value_name = "MS")]
        poll: Option<u64>,
    },

    /// Scan a local directory and print what would be synced
    Scan {
        /// Directory to scan
        path: PathBuf,

        /// Additional exclusion pattern, anchored at the root
        #[arg(short = 'x', long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Summary)]
        format: Format,
    },

    /// Show version and build info
    Version,
}

/// Where the mirror lives. Exactly one kind of target must be given.
#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Mirror into a directory on this machine
    #[arg(long, value_name = "DIR", conflicts_with_all = ["ssh", "exec"])]
    to_dir: Option<PathBuf>,

    /// Mirror over ssh (user@host:/path)
    #[arg(long, value_name = "USER@HOST:/PATH", conflicts_with = "exec")]
    ssh: Option<String>,

    /// SSH port
    #[arg(short, long, default_value_t = 22)]
    port: u16,

    /// Remote root for a command target
    #[arg(long, value_name = "PATH")]
    remote_root: Option<String>,

    /// Command that runs its trailing arguments on the remote
    #[arg(last = true, value_name = "CMD")]
    exec: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Remove remote-only entries
    Local,
    /// Pull remote-only entries
    Merge,
}

impl From<PolicyArg> for InitialPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Local => Self::LocalAuthoritative,
            PolicyArg::Merge => Self::Merge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Summary,
    Json,
}

/// A resolved target
struct Target {
    transport: Box<dyn TransportAdapter>,
    description: String,
    /// Set for remote shell targets, which can lose their connection
    shell: Option<Arc<ExecTransport>>,
}

impl TargetArgs {
    fn resolve(&self) -> Result<Target> {
        let given = [
            self.to_dir.is_some(),
            self.ssh.is_some(),
            !self.exec.is_empty(),
        ];
        match given.iter().filter(|&&g| g).count() {
            1 => {}
            0 => bail!("No target given: use --to-dir, --ssh or `-- <command>`"),
            _ => bail!("Only one of --to-dir, --ssh or `-- <command>` may be given"),
        }
        if self.remote_root.is_some() && self.exec.is_empty() {
            bail!("--remote-root only applies to a command target");
        }

        if let Some(dir) = &self.to_dir {
            let transport = LocalTransport::new(dir)
                .map_err(|e| eyre!("Cannot use {} as target: {e}", dir.display()))?;
            let description = transport.describe();
            return Ok(Target {
                transport: Box::new(transport),
                description,
                shell: None,
            });
        }

        let (shell, root) = if let Some(ssh) = &self.ssh {
            RemoteShell::ssh_target(ssh, self.port)
                .ok_or_else(|| eyre!("Invalid ssh target {ssh:?}, expected user@host:/path"))?
        } else {
            let root = self
                .remote_root
                .clone()
                .ok_or_else(|| eyre!("A command target needs --remote-root"))?;
            let (program, args) = self
                .exec
                .split_first()
                .ok_or_else(|| eyre!("Empty target command"))?;
            let shell = RemoteShell::Exec {
                program: program.clone(),
                args: args.to_vec(),
            };
            (shell, root)
        };

        let transport = Arc::new(ExecTransport::new(shell, root));
        Ok(Target {
            transport: Box::new(Arc::clone(&transport)),
            description: transport.describe(),
            shell: Some(transport),
        })
    }
}

impl Target {
    /// Fail fast when a remote shell cannot be reached at all
    async fn ping(&self) -> Result<()> {
        if let Some(shell) = &self.shell {
            shell
                .ping()
                .await
                .map_err(|e| eyre!("Cannot reach {}: {e}", self.description))?;
        }
        Ok(())
    }

    fn monitor(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        self.shell
            .as_ref()
            .map(|shell| Arc::clone(shell).spawn_monitor(MONITOR_INTERVAL))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let root = match &cli.command {
        Commands::Sync { local, .. } | Commands::Watch { local, .. } => Some(local.as_path()),
        Commands::Scan { .. } | Commands::Version => None,
    };
    let session = debug_log::init(cli.verbose, &debug_log::log_dir_for(root));
    debug!("Debug log: {}", session.log_path.display());

    match cli.command {
        Commands::Version => {
            eprintln!("livesync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Scan {
            path,
            exclude,
            format,
        } => {
            scan_command(&path, &exclude, format)?;
        }
        Commands::Sync {
            local,
            target,
            exclude,
            policy,
        } => {
            let options = load_options(&local, &exclude, policy)?;
            sync_command(&local, &target, options).await?;
        }
        Commands::Watch {
            local,
            target,
            exclude,
            policy,
            debounce,
            poll,
        } => {
            let mut options = load_options(&local, &exclude, policy)?;
            if let Some(ms) = debounce {
                options.batcher.window = Duration::from_millis(ms);
            }
            if let Some(ms) = poll {
                options = options.poll_interval(Duration::from_millis(ms.max(1)));
            }
            watch_command(&local, &target, options).await?;
        }
    }

    Ok(())
}

/// `.livesync.toml` from the local root, then command line overrides
fn load_options(
    local: &Path,
    exclude: &[String],
    policy: Option<PolicyArg>,
) -> Result<SyncOptions> {
    let config = LivesyncConfig::load(local)?;
    let mut options = config
        .to_options()
        .exclude(exclude.iter().map(ExclusionRule::new));
    if let Some(policy) = policy {
        options = options.policy(policy.into());
    }
    Ok(options)
}

fn scan_command(path: &Path, exclude: &[String], format: Format) -> Result<()> {
    info!("Scanning {}...", path.display());

    let rules = load_options(path, exclude, None)?.exclude;
    let matcher = ExclusionMatcher::new(rules)?;
    let snapshot = Scanner::new(path).scan(&matcher)?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&snapshot)?;
            println!("{json}");
        }
        Format::Summary => print_summary(&snapshot),
    }
    Ok(())
}

fn print_summary(snapshot: &Snapshot) {
    let files = snapshot.iter().filter(|(_, meta)| meta.is_file()).count();
    let dirs = snapshot.len() - files;
    let total_size: u64 = snapshot.iter().map(|(_, meta)| meta.size).sum();
    print_status(
        Status::SCANNED,
        &format!(
            "{files} files, {dirs} directories ({})",
            humansize::format_size(total_size, humansize::BINARY)
        ),
    );

    if snapshot.len() <= SCAN_LISTING_LIMIT {
        for (path, meta) in snapshot.iter() {
            match meta.kind {
                EntryKind::Dir => eprintln!("  {path}/"),
                EntryKind::File => eprintln!(
                    "  {path} ({})",
                    humansize::format_size(meta.size, humansize::BINARY)
                ),
            }
        }
    }
    for error in snapshot.errors() {
        print_warning("Unreadable", &error.to_string());
    }
}

async fn sync_command(local: &Path, target: &TargetArgs, options: SyncOptions) -> Result<()> {
    let target = target.resolve()?;
    let root = SyncRoot::new(local, target.description.clone())?;
    info!("Syncing {root}");
    target.ping().await?;

    let progress = SyncProgress::new();
    let spinner = progress.sync_spinner(&root.to_string());
    let result = SyncOrchestrator::new(root, target.transport, options)
        .run_initial_sync()
        .await;
    spinner.finish_and_clear();

    let report = result?;
    progress.finish_sync(&report);
    for (path, message) in &report.failing {
        warn!("{path}: {message}");
    }
    for (side, error) in &report.scan_errors {
        warn!("{side:?} side: {error}");
    }
    if !report.is_clean() {
        bail!(
            "{} paths failed to sync and {} entries could not be read",
            report.failing.len(),
            report.scan_errors.len()
        );
    }
    Ok(())
}

async fn watch_command(local: &Path, target: &TargetArgs, options: SyncOptions) -> Result<()> {
    let target = target.resolve()?;
    let root = SyncRoot::new(local, target.description.clone())?;
    root.validate()?;
    target.ping().await?;

    let progress = SyncProgress::new();
    print_status(Status::SYNCING, &root.to_string());

    // Dropping the watcher ends the event feed
    let (_watcher, events) = watcher::spawn(root.local())?;
    let monitor = target.monitor();
    let mut orchestrator =
        SyncOrchestrator::new(root, target.transport, options).with_watch_events(events);
    if let Some(status) = monitor {
        orchestrator = orchestrator.with_connection_status(status);
    }
    let handle = orchestrator.start();

    let state = handle
        .wait_for_state(|s| s == SessionState::Watching || s.is_terminal())
        .await;
    if state == SessionState::Watching {
        print_status(Status::WATCHING, "for changes (Ctrl+C to stop)");

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Interrupted, stopping");
            }
            state = handle.wait_for_state(SessionState::is_terminal) => {
                debug!("Session ended on its own: {state}");
            }
        }
    }

    let report = handle.stop().await?;
    progress.finish_session(&report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("livesync").chain(args.iter().copied())).unwrap()
    }

    fn target_of(cli: Cli) -> TargetArgs {
        match cli.command {
            Commands::Sync { target, .. } | Commands::Watch { target, .. } => target,
            _ => panic!("not a sync command"),
        }
    }

    #[test]
    fn test_parse_sync_to_dir() {
        let cli = parse(&["sync", "./site", "--to-dir", "/tmp/mirror", "-x", "*.log"]);
        let Commands::Sync {
            local,
            target,
            exclude,
            policy,
        } = cli.command
        else {
            panic!("expected sync");
        };
        assert_eq!(local, PathBuf::from("./site"));
        assert_eq!(target.to_dir, Some(PathBuf::from("/tmp/mirror")));
        assert_eq!(exclude, vec!["*.log".to_string()]);
        assert_eq!(policy, None);
    }

    #[test]
    fn test_parse_watch_exec_target() {
        let cli = parse(&[
            "watch",
            "./site",
            "--remote-root",
            "/app",
            "--debounce",
            "50",
            "--",
            "docker",
            "exec",
            "-i",
            "web",
        ]);
        let Commands::Watch {
            target, debounce, ..
        } = cli.command
        else {
            panic!("expected watch");
        };
        assert_eq!(debounce, Some(50));
        assert_eq!(target.remote_root.as_deref(), Some("/app"));
        assert_eq!(target.exec, vec!["docker", "exec", "-i", "web"]);
    }

    #[test]
    fn test_parse_rejects_two_targets() {
        let result = Cli::try_parse_from([
            "livesync",
            "sync",
            "./site",
            "--to-dir",
            "/tmp/a",
            "--ssh",
            "u@h:/b",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_requires_a_target() {
        let target = target_of(parse(&["sync", "./site"]));
        let err = target.resolve().err().unwrap();
        assert!(err.to_string().contains("No target given"));
    }

    #[test]
    fn test_resolve_ssh_target() {
        let args = ["sync", "./site", "--ssh", "dev@box:/srv/site", "-p", "2222"];
        let target = target_of(parse(&args));
        let resolved = target.resolve().unwrap();
        let shell = resolved.shell.unwrap();
        assert_eq!(shell.root(), "/srv/site");
        assert_eq!(
            *shell.shell(),
            RemoteShell::Ssh {
                user: "dev".to_string(),
                host: "box".to_string(),
                port: 2222,
            }
        );

        let bad = target_of(parse(&["sync", "./site", "--ssh", "box"]));
        assert!(bad.resolve().is_err());
    }

    #[test]
    fn test_resolve_exec_target_needs_root() {
        let target = target_of(parse(&["sync", "./site", "--", "docker", "exec", "-i", "web"]));
        let err = target.resolve().err().unwrap();
        assert!(err.to_string().contains("--remote-root"));

        let args = ["sync", "./site", "--ssh", "u@h:/a", "--remote-root", "/b"];
        let stray = target_of(parse(&args));
        assert!(stray.resolve().is_err());
    }

    #[test]
    fn test_resolve_dir_target_creates_it() {
        let dir = TempDir::new().unwrap();
        let mirror = dir.path().join("mirror");
        let target = TargetArgs {
            to_dir: Some(mirror.clone()),
            ssh: None,
            port: 22,
            remote_root: None,
            exec: Vec::new(),
        };
        let resolved = target.resolve().unwrap();
        assert!(mirror.is_dir());
        assert!(resolved.shell.is_none());
        assert!(resolved.description.starts_with("local:"));
    }

    #[test]
    fn test_command_line_extends_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(livesync_core::config::CONFIG_FILE),
            "exclude = [\"build\"]\n[sync]\npolicy = \"merge\"\n",
        )
        .unwrap();

        let options = load_options(dir.path(), &["*.tmp".to_string()], None).unwrap();
        let patterns: Vec<_> = options.exclude.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["build", "*.tmp"]);
        assert_eq!(options.policy, InitialPolicy::Merge);

        let options = load_options(dir.path(), &[], Some(PolicyArg::Local)).unwrap();
        assert_eq!(options.policy, InitialPolicy::LocalAuthoritative);
    }
}
