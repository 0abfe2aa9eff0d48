//! One match, end to end.
//!
//! Groups are created before anything is spawned and are owned by guards
//! that outlive every process, so they are removed on every exit path, and
//! only after the final counters have been read.

use crate::arbiter;
use crate::cgroup::{CgroupGuard, CgroupManager};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::launcher::{self, LaunchSpec, SandboxProcess, UserNamespaceIsolation};
use crate::monitor::ResourceMonitor;
use crate::pipes::PipeSet;
use crate::stats::{self, MatchReport, SandboxUsage};
use std::path::PathBuf;
use tracing::{info, warn};

/// Run the judge against the player and report the verdict with the
/// resource usage of both.
///
/// Returns `Err` only for setup failures. A timeout is a normal outcome.
pub async fn run_match(config: RunConfig) -> Result<MatchReport> {
    config.validate()?;
    let controller_exe = match &config.controller_exe {
        Some(path) => path.clone(),
        None => current_exe()?,
    };

    let manager = CgroupManager::new(&config.cgroups);
    manager.enable_controllers();
    let judge_cg = manager.create(&config.cgroups.judge_name)?;
    let player_cg = manager.create(&config.cgroups.player_name)?;

    let pipes = PipeSet::allocate()?;
    let isolation = UserNamespaceIsolation::for_current_user();
    let sb = &config.sandbox;

    let player = launcher::spawn(
        LaunchSpec {
            name: "player",
            controller_exe: &controller_exe,
            rootfs: &sb.player_rootfs,
            target: &sb.player_cmd,
            stdio: pipes.player,
        },
        &isolation,
        &player_cg,
    )?;
    let judge = match launcher::spawn(
        LaunchSpec {
            name: "judge",
            controller_exe: &controller_exe,
            rootfs: &sb.judge_rootfs,
            target: &sb.judge_cmd,
            stdio: pipes.judge,
        },
        &isolation,
        &judge_cg,
    ) {
        Ok(judge) => judge,
        Err(e) => {
            discard(&player);
            return Err(e);
        }
    };

    let monitor = ResourceMonitor::start(&judge_cg, &player_cg, config.sample_interval);
    let outcome = arbiter::arbitrate(pipes.report, sb.timeout(), &judge, &player).await;
    let sampled = monitor.stop().await;

    let arbitration = match outcome {
        Ok(arbitration) => arbitration,
        Err(e) => {
            discard(&judge);
            discard(&player);
            return Err(e);
        }
    };

    let report = stats::collect(arbitration, sampled, (&judge, &judge_cg), (&player, &player_cg));
    for usage in [&report.judge, &report.player] {
        note_exit(usage);
    }
    info!(verdict = %report.verdict, "Match finished");

    release(judge_cg, player_cg);
    Ok(report)
}

fn current_exe() -> Result<PathBuf> {
    std::env::current_exe().map_err(|e| Error::Spawn(format!("locate controller binary: {}", e)))
}

/// Kill and reap a sandbox whose match is being abandoned.
fn discard(process: &SandboxProcess) {
    if let Err(e) = process.kill() {
        warn!(sandbox = process.name(), error = %e, "Failed to kill sandbox");
    }
    if let Err(e) = process.wait() {
        warn!(sandbox = process.name(), error = %e, "Failed to reap sandbox");
    }
}

fn note_exit(usage: &SandboxUsage) {
    if usage.exit.is_bootstrap_failure() {
        warn!(sandbox = %usage.name, "Sandbox bootstrap failed before the payload started");
    }
    if !usage.confined {
        warn!(sandbox = %usage.name, cgroup = %usage.cgroup,
              "Sandbox ran outside its cgroup, usage figures do not cover it");
    }
}

/// Remove both groups now that their counters have been read.
fn release(judge: CgroupGuard, player: CgroupGuard) {
    drop(judge);
    drop(player);
}
