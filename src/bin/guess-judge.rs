//! Guessing-game judge. Talks to the player on stdin/stdout and writes its
//! one-line report to fd 3.

use pairjudge::guess::{self, SECRET};
use pairjudge::pipes::REPORT_FD;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::os::fd::FromRawFd;
use std::process::ExitCode;

fn main() -> ExitCode {
    // SAFETY: the launcher installs the report pipe on this descriptor and
    // nothing else in this process owns it.
    let mut report_channel = unsafe { File::from_raw_fd(REPORT_FD) };

    let stdin = io::stdin();
    let report = match guess::judge(SECRET, BufReader::new(stdin.lock()), io::stdout().lock()) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("guess-judge: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = writeln!(report_channel, "{}", report.to_line()) {
        eprintln!("guess-judge: report channel: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
