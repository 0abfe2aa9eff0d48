//! Final per-sandbox usage and the match report.

use crate::arbiter::{Arbitration, Verdict};
use crate::cgroup::{CgroupHandle, CgroupManager, CgroupStats};
use crate::launcher::{ExitState, SandboxProcess};
use crate::monitor::SampledPeaks;
use serde::Serialize;
use std::fmt;

const MB: f64 = 1024.0 * 1024.0;

/// Resource usage of one sandbox after it has been reaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxUsage {
    pub name: String,
    pub cgroup: String,
    pub exit: ExitState,
    /// `false` when the process never made it into its cgroup; the
    /// counters below then do not describe it.
    pub confined: bool,
    pub memory_peak_bytes: u64,
    pub cpu_user_usec: u64,
    pub cpu_system_usec: u64,
}

impl SandboxUsage {
    /// Merge kernel counters with the sampler's peak, keeping the larger
    /// memory figure.
    pub fn merge(
        process: &SandboxProcess,
        cgroup: &CgroupHandle,
        exit: ExitState,
        stats: CgroupStats,
        sampled_peak: u64,
    ) -> Self {
        Self {
            name: process.name().to_string(),
            cgroup: cgroup.name().to_string(),
            exit,
            confined: process.confined(),
            memory_peak_bytes: stats.memory_peak_bytes.max(sampled_peak),
            cpu_user_usec: stats.cpu_user_usec,
            cpu_system_usec: stats.cpu_system_usec,
        }
    }
}

impl fmt::Display for SandboxUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Exit: {}", self.exit)?;
        if !self.confined {
            writeln!(f, "  Warning: not confined to cgroup {}", self.cgroup)?;
        }
        writeln!(f, "  Memory Peak: {:.2} MB", self.memory_peak_bytes as f64 / MB)?;
        write!(
            f,
            "  CPU Usage: user={:.2} ms, system={:.2} ms",
            self.cpu_user_usec as f64 / 1000.0,
            self.cpu_system_usec as f64 / 1000.0
        )
    }
}

/// Everything a completed match produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    pub verdict: Verdict,
    pub judge: SandboxUsage,
    pub player: SandboxUsage,
}

impl fmt::Display for MatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[controller] result: {}", self.verdict)?;
        writeln!(f)?;
        writeln!(f, "[CGROUP STATS] Judge:")?;
        writeln!(f, "{}", self.judge)?;
        writeln!(f)?;
        writeln!(f, "[CGROUP STATS] Player:")?;
        write!(f, "{}", self.player)
    }
}

/// Build the report once both sandboxes are reaped and the sampler has
/// stopped. Must run before the cgroups are removed.
pub fn collect(
    arbitration: Arbitration,
    sampled: SampledPeaks,
    judge: (&SandboxProcess, &CgroupHandle),
    player: (&SandboxProcess, &CgroupHandle),
) -> MatchReport {
    let judge_stats = CgroupManager::read_stats(judge.1);
    let player_stats = CgroupManager::read_stats(player.1);

    MatchReport {
        verdict: arbitration.verdict,
        judge: SandboxUsage::merge(judge.0, judge.1, arbitration.judge_exit, judge_stats, sampled.judge),
        player: SandboxUsage::merge(player.0, player.1, arbitration.player_exit, player_stats, sampled.player),
    }
}
