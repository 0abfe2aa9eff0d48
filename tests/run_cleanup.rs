//! Groups are removed after a match even when the sandboxes never get as
//! far as the payload.

use pairjudge::arbiter::Verdict;
use pairjudge::{run_match, CgroupConfig, Error, RunConfig, SandboxConfig};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn config(cgroups: &TempDir) -> RunConfig {
    let mut config = RunConfig::new(SandboxConfig {
        judge_rootfs: PathBuf::from("/nonexistent/pairjudge/judge"),
        judge_cmd: PathBuf::from("/bin/judge"),
        player_rootfs: PathBuf::from("/nonexistent/pairjudge/player"),
        player_cmd: PathBuf::from("/bin/player"),
        timeout_ms: 300,
    });
    config.cgroups = CgroupConfig {
        root: cgroups.path().to_path_buf(),
        memory_limit_mb: None,
        cpu_max: None,
        ..CgroupConfig::default()
    };
    config.sample_interval = Duration::from_millis(5);
    config.controller_exe = Some(PathBuf::from(env!("CARGO_BIN_EXE_pairjudge")));
    config
}

#[tokio::test]
async fn groups_are_removed_whatever_the_outcome() {
    let cgroups = TempDir::new().unwrap();
    let config = config(&cgroups);
    let judge_dir = cgroups.path().join(&config.cgroups.judge_name);
    let player_dir = cgroups.path().join(&config.cgroups.player_name);

    // Without user namespace support the spawn fails; with it, both
    // bootstraps fail on the missing root and the deadline passes silently.
    match run_match(config).await {
        Ok(report) => {
            assert_eq!(report.verdict, Verdict::Timeout);
            assert!(report.judge.exit.is_bootstrap_failure() || report.judge.exit.was_force_killed());
        }
        Err(e) => assert!(
            matches!(e, Error::Spawn(_) | Error::Namespace(_)),
            "unexpected error: {}",
            e
        ),
    }

    assert!(!judge_dir.exists());
    assert!(!player_dir.exists());
}

#[tokio::test]
async fn invalid_config_creates_nothing() {
    let cgroups = TempDir::new().unwrap();
    let mut config = config(&cgroups);
    config.cgroups.player_name = config.cgroups.judge_name.clone();

    assert!(run_match(config).await.is_err());
    assert_eq!(std::fs::read_dir(cgroups.path()).unwrap().count(), 0);
}
