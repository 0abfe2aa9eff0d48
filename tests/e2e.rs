//! Full sandboxed match. Needs root, cgroup v2 and two prepared root
//! filesystems whose `/bin/judge` and `/bin/player` are the `guess-judge`
//! and `guess-player` binaries:
//!
//!   PAIRJUDGE_E2E_JUDGE_ROOTFS=/srv/judge PAIRJUDGE_E2E_PLAYER_ROOTFS=/srv/player \
//!       cargo test --test e2e
//!
//! The judge root also needs a `/bin/sh` for the environment check.
//!
//! Skipped when any of that is missing.

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use pairjudge::cgroup::CgroupManager;
use pairjudge::launcher::{self, ExitState, LaunchSpec, UserNamespaceIsolation};
use pairjudge::pipes::StreamEnds;
use pairjudge::CgroupConfig;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const ENVIRONMENT_CHECK: &str = r#"
if [ -e /proc/self/status ]; then echo PROC_PRESENT; else echo PROC_ABSENT; fi
while read key value; do
    if [ "$key" = "SigIgn:" ]; then echo "SIGIGN $value"; fi
done < /proc/self/status
"#;

fn prepared_roots() -> Option<(PathBuf, PathBuf)> {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("skipping: not root");
        return None;
    }
    let judge = std::env::var_os("PAIRJUDGE_E2E_JUDGE_ROOTFS")?;
    let player = std::env::var_os("PAIRJUDGE_E2E_PLAYER_ROOTFS")?;
    Some((PathBuf::from(judge), PathBuf::from(player)))
}

#[test]
fn guessing_game_is_accepted_in_sandboxes() {
    let Some((judge_rootfs, player_rootfs)) = prepared_roots() else {
        return;
    };

    let output = Command::new(env!("CARGO_BIN_EXE_pairjudge"))
        .arg("--judge-rootfs")
        .arg(&judge_rootfs)
        .arg("--player-rootfs")
        .arg(&player_rootfs)
        .args(["--judge-cgroup", "pairjudge_e2e_judge", "--player-cgroup", "pairjudge_e2e_player"])
        .arg("--json")
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.starts_with("[controller] result: {\"status\":\"AC\"}"), "stdout: {}", stdout);

    let json: serde_json::Value = serde_json::from_str(stdout.lines().last().unwrap()).unwrap();
    assert_eq!(json["verdict"], "{\"status\":\"AC\"}");
    assert_eq!(json["judge"]["exit"]["exited"], 0);
    assert!(json["player"]["confined"].as_bool().unwrap());

    assert!(!PathBuf::from("/sys/fs/cgroup/pairjudge_e2e_judge").exists());
    assert!(!PathBuf::from("/sys/fs/cgroup/pairjudge_e2e_player").exists());
}

#[test]
fn payload_sees_proc_and_default_sigpipe() {
    let Some((judge_rootfs, _)) = prepared_roots() else {
        return;
    };
    let shell = Path::new("/bin/sh");
    if !judge_rootfs.join("bin/sh").exists() {
        eprintln!("skipping: no /bin/sh in {}", judge_rootfs.display());
        return;
    }

    let cgroups = TempDir::new().unwrap();
    let manager = CgroupManager::new(&CgroupConfig {
        root: cgroups.path().to_path_buf(),
        memory_limit_mb: None,
        cpu_max: None,
        ..CgroupConfig::default()
    });
    let group = manager.create("pairjudge_e2e_shell").unwrap();

    let (stdin_r, stdin_w) = pipe2(OFlag::O_CLOEXEC).unwrap();
    let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC).unwrap();
    let process = launcher::spawn(
        LaunchSpec {
            name: "judge",
            controller_exe: Path::new(env!("CARGO_BIN_EXE_pairjudge")),
            rootfs: &judge_rootfs,
            target: shell,
            stdio: StreamEnds {
                stdin: stdin_r,
                stdout: stdout_w,
                extra: Vec::new(),
            },
        },
        &UserNamespaceIsolation::for_current_user(),
        &group,
    )
    .unwrap();

    let mut script = File::from(stdin_w);
    script.write_all(ENVIRONMENT_CHECK.as_bytes()).unwrap();
    drop(script);
    let mut output = String::new();
    File::from(stdout_r).read_to_string(&mut output).unwrap();
    assert_eq!(process.wait().unwrap(), ExitState::Exited(0), "output: {}", output);

    assert!(output.contains("PROC_PRESENT"), "output: {}", output);
    let mask = output
        .lines()
        .find_map(|line| line.strip_prefix("SIGIGN "))
        .map(|hex| u64::from_str_radix(hex.trim(), 16).unwrap())
        .unwrap();
    assert_eq!(mask & (1 << (libc::SIGPIPE - 1)), 0, "SIGPIPE ignored: {:x}", mask);
}
