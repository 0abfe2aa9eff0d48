//! Guessing-game player: binary search against the judge on stdin/stdout.

use pairjudge::guess;
use std::io::{self, BufReader};
use std::process::ExitCode;

fn main() -> ExitCode {
    let stdin = io::stdin();
    match guess::play(BufReader::new(stdin.lock()), io::stdout().lock()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("guess-player: {}", e);
            ExitCode::FAILURE
        }
    }
}
