//! The three channels that wire judge, player and controller together.
//!
//! ```text
//!   judge stdout ──────────────▶ player stdin
//!   judge stdin  ◀────────────── player stdout
//!   judge fd 3   ──────────────▶ controller (report)
//! ```

use crate::error::{Error, Result};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::os::fd::OwnedFd;

/// File descriptor number the judge writes its verdict line to.
pub const REPORT_FD: i32 = 3;

/// Descriptors handed to one sandboxed child. `extra[i]` lands on fd `3 + i`.
#[derive(Debug)]
pub struct StreamEnds {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub extra: Vec<OwnedFd>,
}

/// All pipe ends for one match, split by owner.
#[derive(Debug)]
pub struct PipeSet {
    pub judge: StreamEnds,
    pub player: StreamEnds,
    /// Read end of the report channel, kept by the controller.
    pub report: OwnedFd,
}

impl PipeSet {
    /// Allocate all three pipes close-on-exec. The launcher clears the flag
    /// only on the descriptors it installs into a child.
    pub fn allocate() -> Result<Self> {
        let (judge_to_player_r, judge_to_player_w) = new_pipe("judge->player")?;
        let (player_to_judge_r, player_to_judge_w) = new_pipe("player->judge")?;
        let (report_r, report_w) = new_pipe("report")?;

        Ok(PipeSet {
            judge: StreamEnds {
                stdin: player_to_judge_r,
                stdout: judge_to_player_w,
                extra: vec![report_w],
            },
            player: StreamEnds {
                stdin: judge_to_player_r,
                stdout: player_to_judge_w,
                extra: Vec::new(),
            },
            report: report_r,
        })
    }
}

fn new_pipe(label: &str) -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Pipe(format!("{}: {}", label, e)))
}
