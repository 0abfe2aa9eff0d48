//! pairjudge - run an interactive judge against a player in Linux sandboxes.
//!
//! Usage:
//!   pairjudge --judge-rootfs <dir> --player-rootfs <dir> [--timeout 5000] [--json]
//!
//! The same binary is re-invoked inside each sandbox with `SANDBOX_INIT=1`
//! and then performs the in-namespace bootstrap instead of a match.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

#[cfg(target_os = "linux")]
use clap::Parser;
#[cfg(target_os = "linux")]
use pairjudge::bootstrap::{self, EntryMode};
#[cfg(target_os = "linux")]
use pairjudge::config::{self, CgroupConfig, CpuMax, RunConfig, SandboxConfig};
#[cfg(target_os = "linux")]
use std::path::PathBuf;
#[cfg(target_os = "linux")]
use std::process::ExitCode;
#[cfg(target_os = "linux")]
use std::time::Duration;
#[cfg(target_os = "linux")]
use tracing::error;

#[cfg(target_os = "linux")]
#[derive(Parser, Debug)]
#[command(name = "pairjudge")]
#[command(about = "Run an interactive judge against a player in isolated sandboxes")]
struct Args {
    /// Root filesystem of the judge sandbox
    #[arg(long)]
    judge_rootfs: Option<PathBuf>,

    /// Judge executable, resolved inside its root
    #[arg(long, default_value = config::DEFAULT_JUDGE_CMD)]
    judge_cmd: PathBuf,

    /// Root filesystem of the player sandbox
    #[arg(long)]
    player_rootfs: Option<PathBuf>,

    /// Player executable, resolved inside its root
    #[arg(long, default_value = config::DEFAULT_PLAYER_CMD)]
    player_cmd: PathBuf,

    /// Match deadline in milliseconds
    #[arg(long, default_value_t = config::DEFAULT_TIMEOUT_MS)]
    timeout: u64,

    /// cgroup v2 mount the sandbox groups are created under
    #[arg(long, default_value = config::DEFAULT_CGROUP_ROOT)]
    cgroup_root: PathBuf,

    /// Group name for the judge
    #[arg(long, default_value = config::DEFAULT_JUDGE_CGROUP)]
    judge_cgroup: String,

    /// Group name for the player
    #[arg(long, default_value = config::DEFAULT_PLAYER_CGROUP)]
    player_cgroup: String,

    /// Memory ceiling per sandbox in MB, 0 for none
    #[arg(long, default_value_t = config::DEFAULT_MEMORY_LIMIT_MB)]
    memory_limit_mb: u64,

    /// cgroup cpu.max value "<quota|max> [period]", empty for none
    #[arg(long, default_value = config::DEFAULT_CPU_MAX)]
    cpu_max: String,

    /// Memory sampling interval in milliseconds
    #[arg(long, default_value_t = config::DEFAULT_SAMPLE_INTERVAL_MS)]
    sample_interval_ms: u64,

    /// Also print the report as one JSON line
    #[arg(long)]
    json: bool,
}

#[cfg(target_os = "linux")]
impl Args {
    fn into_config(self) -> pairjudge::Result<RunConfig> {
        let cpu_max = match self.cpu_max.trim() {
            "" => None,
            value => Some(value.parse::<CpuMax>()?),
        };
        let sandbox = SandboxConfig {
            judge_rootfs: self.judge_rootfs.unwrap_or_default(),
            judge_cmd: self.judge_cmd,
            player_rootfs: self.player_rootfs.unwrap_or_default(),
            player_cmd: self.player_cmd,
            timeout_ms: self.timeout,
        };
        let config = RunConfig {
            cgroups: CgroupConfig {
                root: self.cgroup_root,
                judge_name: self.judge_cgroup,
                player_name: self.player_cgroup,
                memory_limit_mb: (self.memory_limit_mb > 0).then_some(self.memory_limit_mb),
                cpu_max,
            },
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            ..RunConfig::new(sandbox)
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(target_os = "linux")]
fn main() -> ExitCode {
    init_logging();

    // Decided before any runtime thread exists: the bootstrap changes
    // credentials, which must happen in a single-threaded process.
    match EntryMode::detect() {
        Ok(EntryMode::Bootstrap(params)) => bootstrap::enter(params),
        Ok(EntryMode::Controller) => {}
        Err(e) => bootstrap::abort(&e),
    }

    let args = Args::parse();
    let json = args.json;
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run_controller(config, json))
}

#[cfg(target_os = "linux")]
async fn run_controller(config: RunConfig, json: bool) -> ExitCode {
    match pairjudge::run_match(config).await {
        Ok(report) => {
            println!("{}", report);
            if json {
                match serde_json::to_string(&report) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!(error = %e, "Failed to encode report"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
