//! # Sirius Log Daemon
//!
//! Single consumer of the shared-memory log ring. Started by the first
//! native process that needs it (with the spawn token), it drains records
//! in write order into stdout/stderr or configured files and exits once the
//! last native process has detached.
//!
//! ```text
//! sirius_daemon --spawn <TOKEN> --key utils_log --capacity 512
//! sirius_daemon --inspect --key utils_log
//! ```

use clap::Parser;
use sirius::config::{ConfigLoader, TransportConfig};
use sirius::namespace::daemon_spawn_token;
use sirius_shared_log::{Daemon, FdSink, FileMode, SharedSegment};
use std::path::PathBuf;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status for a missing or wrong spawn token.
const EXIT_INVALID_TOKEN: i32 = libc::EINVAL;

/// Sirius log daemon - drains the shared-memory log transport
#[derive(Parser, Debug)]
#[command(name = "sirius_daemon")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Drains the sirius shared-memory log transport")]
#[command(long_about = None)]
struct Args {
    /// Spawn token; required to run as the daemon
    #[arg(long, value_name = "TOKEN")]
    spawn: Option<String>,

    /// Logical segment key
    #[arg(short, long)]
    key: Option<String>,

    /// Ring capacity in slots (rounded up to a power of two)
    #[arg(long)]
    capacity: Option<usize>,

    /// Directory for lock files
    #[arg(long, value_name = "DIR")]
    lock_dir: Option<PathBuf>,

    /// Transport configuration file (TOML); flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print a JSON snapshot of the segment and exit
    #[arg(long)]
    inspect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    if !args.inspect && !token_matches(args.spawn.as_deref()) {
        error!("Missing or invalid spawn token; the daemon is started by the log transport");
        std::process::exit(EXIT_INVALID_TOKEN);
    }

    if let Err(e) = run(&args) {
        error!("Log daemon startup failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(args)?;

    if args.inspect {
        let snapshot = SharedSegment::attach(&config)?.snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    info!(
        "Sirius log daemon v{} starting on key {:?}",
        env!("CARGO_PKG_VERSION"),
        config.key
    );

    let daemon = Daemon::bootstrap(config, Box::new(FdSink::new(FileMode::Truncate)))?;

    let handle = daemon.handle();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        handle.request_stop();
    })?;

    let report = daemon.serve()?;
    info!(
        "Sirius log daemon shutdown complete ({} records)",
        report.delivered
    );
    Ok(())
}

fn token_matches(token: Option<&str>) -> bool {
    token.is_some_and(|token| token == daemon_spawn_token())
}

/// Load the optional config file, then apply CLI overrides.
fn build_config(args: &Args) -> Result<TransportConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading transport config from {}", path.display());
            TransportConfig::load(path)?
        }
        None => TransportConfig::default(),
    };

    if let Some(key) = &args.key {
        config.key = key.clone();
    }
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(dir) = &args.lock_dir {
        config.lock_dir = Some(dir.clone());
    }
    // The daemon never spawns itself.
    config.spawn_daemon = false;
    if let Err(e) = config.validate() {
        warn!("Rejected transport config: {}", e);
        return Err(e.into());
    }
    Ok(config)
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout belongs to the drained records.
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("sirius_daemon").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_spawn_arguments() {
        let args = parse(&[
            "--spawn",
            "tok",
            "--key",
            "app_log",
            "--capacity",
            "64",
            "--lock-dir",
            "/tmp/locks",
        ]);
        assert_eq!(args.spawn.as_deref(), Some("tok"));
        assert_eq!(args.key.as_deref(), Some("app_log"));
        assert_eq!(args.capacity, Some(64));
        assert_eq!(args.lock_dir, Some(PathBuf::from("/tmp/locks")));
        assert!(!args.inspect);
    }

    #[test]
    fn test_token_validation() {
        assert!(token_matches(Some(&daemon_spawn_token())));
        assert!(!token_matches(Some("wrong")));
        assert!(!token_matches(None));
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "key = \"from_file\"\ncapacity = 32\nclaim_timeout_ms = 250").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = parse(&["--config", &path, "--capacity", "100"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.key, "from_file");
        assert_eq!(config.capacity, 100);
        assert_eq!(config.effective_capacity(), 128);
        assert_eq!(config.claim_timeout_ms, 250);
        assert!(!config.spawn_daemon);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = parse(&["--capacity", "0"]);
        assert!(build_config(&args).is_err());
    }
}
