//! Reference payloads: a number-guessing judge and a binary-search player.
//!
//! The judge answers each guess with one line (`too small`, `too large` or
//! `correct`) and ends with a JSON report such as `{"status":"AC"}`.

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};

pub const SECRET: u32 = 731;
pub const LOWER: u32 = 1;
pub const UPPER: u32 = 1000;
pub const MAX_GUESSES: u32 = 10;

pub const TOO_SMALL: &str = "too small";
pub const TOO_LARGE: &str = "too large";
pub const CORRECT: &str = "correct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    AC,
    WA,
    RE,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

impl Report {
    fn accepted() -> Self {
        Self { status: Status::AC, reason: None }
    }

    fn rejected(status: Status, reason: &str) -> Self {
        Self { status, reason: Some(reason.to_string()) }
    }

    /// Single-line JSON, as written to the report channel.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"status\":\"RE\"}"))
    }
}

/// Referee one game over `input`/`output`.
///
/// A closed stream before the secret is found counts as bad input.
pub fn judge<R: BufRead, W: Write>(secret: u32, input: R, mut output: W) -> io::Result<Report> {
    let mut lines = input.lines();
    for _ in 0..MAX_GUESSES {
        let line = match lines.next() {
            Some(line) => line?,
            None => return Ok(Report::rejected(Status::RE, "bad input")),
        };
        let guess: u32 = match line.trim().parse() {
            Ok(guess) => guess,
            Err(_) => return Ok(Report::rejected(Status::RE, "bad input")),
        };
        let reply = match guess.cmp(&secret) {
            std::cmp::Ordering::Less => TOO_SMALL,
            std::cmp::Ordering::Greater => TOO_LARGE,
            std::cmp::Ordering::Equal => CORRECT,
        };
        writeln!(output, "{}", reply)?;
        output.flush()?;
        if reply == CORRECT {
            return Ok(Report::accepted());
        }
    }
    Ok(Report::rejected(Status::WA, "limit"))
}

/// Binary search over `[LOWER, UPPER]`. Returns the number of guesses made.
pub fn play<R: BufRead, W: Write>(input: R, mut output: W) -> io::Result<u32> {
    let (mut lo, mut hi) = (LOWER, UPPER);
    let mut lines = input.lines();
    let mut guesses = 0;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        writeln!(output, "{}", mid)?;
        output.flush()?;
        guesses += 1;

        let Some(reply) = lines.next() else { break };
        match reply?.trim() {
            TOO_SMALL => lo = mid + 1,
            TOO_LARGE => hi = mid.saturating_sub(1),
            _ => break,
        }
    }
    Ok(guesses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn player_finds_secret_within_limit() {
        let (judge_end, player_end) = UnixStream::pair().unwrap();
        let player = thread::spawn(move || {
            let reader = BufReader::new(player_end.try_clone().unwrap());
            play(reader, player_end).unwrap()
        });

        let reader = BufReader::new(judge_end.try_clone().unwrap());
        let report = judge(SECRET, reader, &judge_end).unwrap();
        drop(judge_end);

        assert_eq!(report, Report { status: Status::AC, reason: None });
        assert_eq!(report.to_line(), "{\"status\":\"AC\"}");
        assert!(player.join().unwrap() <= MAX_GUESSES);
    }

    #[test]
    fn every_secret_in_range_is_found() {
        for secret in [LOWER, 2, 500, 999, UPPER] {
            let (judge_end, player_end) = UnixStream::pair().unwrap();
            let player = thread::spawn(move || {
                let reader = BufReader::new(player_end.try_clone().unwrap());
                play(reader, player_end).unwrap()
            });
            let reader = BufReader::new(judge_end.try_clone().unwrap());
            let report = judge(secret, reader, &judge_end).unwrap();
            drop(judge_end);
            assert_eq!(report.status, Status::AC, "secret {}", secret);
            player.join().unwrap();
        }
    }

    #[test]
    fn non_numeric_guess_is_a_runtime_error() {
        let mut replies = Vec::new();
        let report = judge(SECRET, Cursor::new("abc\n"), &mut replies).unwrap();
        assert_eq!(report.to_line(), "{\"status\":\"RE\",\"reason\":\"bad input\"}");
        assert!(replies.is_empty());
    }

    #[test]
    fn running_out_of_guesses_is_wrong_answer() {
        let guesses = "1\n".repeat(MAX_GUESSES as usize + 1);
        let mut replies = Vec::new();
        let report = judge(SECRET, Cursor::new(guesses), &mut replies).unwrap();
        assert_eq!(report, Report::rejected(Status::WA, "limit"));
        let text = String::from_utf8(replies).unwrap();
        assert_eq!(text.lines().count(), MAX_GUESSES as usize);
        assert!(text.lines().all(|l| l == TOO_SMALL));
    }
}
