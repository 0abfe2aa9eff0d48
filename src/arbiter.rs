//! Races the judge's report line against the match deadline, then reaps
//! both sandboxes.
//!
//! ```text
//!   WAITING ──line on report fd──▶ RECEIVED
//!      │
//!      └────deadline elapsed─────▶ TIMED_OUT  (SIGKILL both)
//! ```
//!
//! Either way both processes are waited on before the arbiter returns, so
//! the cgroup counters are final and the groups can be removed.

use crate::error::Result;
use crate::launcher::{ExitState, SandboxProcess};
use serde::{Serialize, Serializer};
use std::fmt;
use std::os::fd::OwnedFd;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const TIMEOUT_VERDICT: &str = "timeout";

/// The single outcome of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Trimmed line the judge wrote to its report channel.
    Reported(String),
    Timeout,
}

impl Verdict {
    pub fn as_str(&self) -> &str {
        match self {
            Verdict::Reported(line) => line,
            Verdict::Timeout => TIMEOUT_VERDICT,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Verdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Verdict plus how each sandbox ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arbitration {
    pub verdict: Verdict,
    pub judge_exit: ExitState,
    pub player_exit: ExitState,
}

/// Wait for the verdict on `report` until `deadline`, then reap both
/// processes.
///
/// A report channel that closes without a complete line is not a verdict;
/// the arbiter keeps waiting for the deadline. After a verdict, processes
/// still alive when the deadline passes are killed.
pub async fn arbitrate(
    report: OwnedFd,
    deadline: Duration,
    judge: &SandboxProcess,
    player: &SandboxProcess,
) -> Result<Arbitration> {
    let expires = Instant::now() + deadline;
    let (tx, rx) = oneshot::channel();
    let reader = tokio::spawn(read_report(report, tx));

    let verdict = match time::timeout_at(expires, rx).await {
        Ok(Ok(line)) => Verdict::Reported(line),
        Ok(Err(_)) => {
            debug!("Report channel closed without a verdict, waiting for deadline");
            time::sleep_until(expires).await;
            Verdict::Timeout
        }
        Err(_) => Verdict::Timeout,
    };
    reader.abort();

    match &verdict {
        Verdict::Reported(line) => info!(verdict = %line, "Judge reported"),
        Verdict::Timeout => {
            info!(deadline_ms = deadline.as_millis() as u64, "Match timed out, killing sandboxes");
            judge.kill()?;
            player.kill()?;
        }
    }

    let mut judge_wait = reap(judge);
    let mut player_wait = reap(player);
    let mut judge_exit = None;
    let mut player_exit = None;
    let mut killed = verdict == Verdict::Timeout;
    let watchdog = time::sleep_until(expires);
    tokio::pin!(watchdog);

    while judge_exit.is_none() || player_exit.is_none() {
        tokio::select! {
            biased;
            res = &mut judge_wait, if judge_exit.is_none() => judge_exit = Some(joined(res)?),
            res = &mut player_wait, if player_exit.is_none() => player_exit = Some(joined(res)?),
            _ = &mut watchdog, if !killed => {
                killed = true;
                for (process, exit, wait) in [
                    (judge, &judge_exit, &judge_wait),
                    (player, &player_exit, &player_wait),
                ] {
                    if exit.is_none() && !wait.is_finished() {
                        warn!(sandbox = process.name(), pid = process.pid().as_raw(),
                              "Sandbox still running after verdict and deadline, killing");
                        process.kill()?;
                    }
                }
            }
        }
    }
    let (judge_exit, player_exit) = judge_exit
        .zip(player_exit)
        .ok_or_else(|| std::io::Error::other("sandbox left unreaped"))?;
    info!(judge = %judge_exit, player = %player_exit, "Sandboxes reaped");

    Ok(Arbitration {
        verdict,
        judge_exit,
        player_exit,
    })
}

async fn read_report(report: OwnedFd, tx: oneshot::Sender<String>) {
    let receiver = match pipe::Receiver::from_owned_fd(report) {
        Ok(receiver) => receiver,
        Err(e) => {
            warn!(error = %e, "Report channel unusable");
            return;
        }
    };
    // The line is opaque to the controller; invalid UTF-8 still counts.
    let mut line = Vec::new();
    match BufReader::new(receiver).read_until(b'\n', &mut line).await {
        Ok(_) if line.ends_with(b"\n") => {
            let _ = tx.send(String::from_utf8_lossy(&line).trim().to_string());
        }
        Ok(_) => {
            let partial = String::from_utf8_lossy(&line);
            debug!(partial = %partial.trim(), "Report channel reached EOF");
        }
        Err(e) => warn!(error = %e, "Failed to read report channel"),
    }
}

fn reap(process: &SandboxProcess) -> JoinHandle<Result<ExitState>> {
    let process = process.clone();
    tokio::task::spawn_blocking(move || process.wait())
}

fn joined(res: std::result::Result<Result<ExitState>, JoinError>) -> Result<ExitState> {
    res.map_err(|e| std::io::Error::other(format!("reaper task failed: {}", e)))?
}
