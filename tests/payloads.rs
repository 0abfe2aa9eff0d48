//! The reference payload binaries wired together over real pipes, the way
//! the launcher wires them inside sandboxes.

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe2;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

const REPORT_FD: RawFd = 3;

fn pipe() -> (OwnedFd, OwnedFd) {
    pipe2(OFlag::O_CLOEXEC).unwrap()
}

fn start(mut cmd: Command, stdin: OwnedFd, stdout: OwnedFd, report: Option<OwnedFd>) -> Child {
    cmd.stdin(Stdio::from(stdin)).stdout(Stdio::from(stdout));
    if let Some(report) = report {
        let raw = report.as_raw_fd();
        // SAFETY: only dup2/fcntl between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if raw == REPORT_FD {
                    let flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD)?);
                    fcntl(raw, FcntlArg::F_SETFD(flags & !FdFlag::FD_CLOEXEC))?;
                } else if libc::dup2(raw, REPORT_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn().unwrap();
        drop(report);
        child
    } else {
        cmd.spawn().unwrap()
    }
}

/// Run the judge against `player` and return the report line.
fn play_match(player: Command) -> String {
    let (player_in, judge_out) = pipe();
    let (judge_in, player_out) = pipe();
    let (report_r, report_w) = pipe();

    let mut judge = start(
        Command::new(env!("CARGO_BIN_EXE_guess-judge")),
        judge_in,
        judge_out,
        Some(report_w),
    );
    let mut player = start(player, player_in, player_out, None);

    assert!(judge.wait().unwrap().success());
    assert!(player.wait().unwrap().success());

    let mut report = String::new();
    File::from(report_r).read_to_string(&mut report).unwrap();
    report
}

#[test]
fn binary_search_player_is_accepted() {
    let report = play_match(Command::new(env!("CARGO_BIN_EXE_guess-player")));
    assert_eq!(report, "{\"status\":\"AC\"}\n");
}

#[test]
fn non_numeric_guess_is_a_runtime_error() {
    let mut player = Command::new("sh");
    player.args(["-c", "echo abc"]);
    let report = play_match(player);
    assert_eq!(report, "{\"status\":\"RE\",\"reason\":\"bad input\"}\n");
}
