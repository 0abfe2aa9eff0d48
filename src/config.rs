//! Run parameters for one match.

use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_JUDGE_CMD: &str = "/bin/judge";
pub const DEFAULT_PLAYER_CMD: &str = "/bin/player";
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEFAULT_JUDGE_CGROUP: &str = "guess_judge";
pub const DEFAULT_PLAYER_CGROUP: &str = "guess_player";
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 100;
pub const DEFAULT_CPU_MAX: &str = "100000 1000000";
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 10;

/// cgroup v2 default `cpu.max` period in microseconds.
const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// Root filesystems, payload paths and deadline for the two sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub judge_rootfs: PathBuf,
    pub judge_cmd: PathBuf,
    pub player_rootfs: PathBuf,
    pub player_cmd: PathBuf,
    pub timeout_ms: u64,
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// CPU bandwidth ceiling in `cpu.max` form. A `None` quota means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMax {
    pub quota_us: Option<u64>,
    pub period_us: u64,
}

impl fmt::Display for CpuMax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quota_us {
            Some(quota) => write!(f, "{} {}", quota, self.period_us),
            None => write!(f, "max {}", self.period_us),
        }
    }
}

impl FromStr for CpuMax {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = s.split_whitespace();
        let quota = fields
            .next()
            .ok_or_else(|| Error::Config("cpu.max: empty value".to_string()))?;
        let quota_us = match quota {
            "max" => None,
            q => Some(
                q.parse::<u64>()
                    .map_err(|e| Error::Config(format!("cpu.max quota {:?}: {}", q, e)))?,
            ),
        };
        let period_us = match fields.next() {
            Some(p) => p
                .parse::<u64>()
                .map_err(|e| Error::Config(format!("cpu.max period {:?}: {}", p, e)))?,
            None => DEFAULT_CPU_PERIOD_US,
        };
        if fields.next().is_some() {
            return Err(Error::Config(format!("cpu.max: too many fields in {:?}", s)));
        }
        if period_us == 0 || quota_us == Some(0) {
            return Err(Error::Config(format!("cpu.max: zero quota or period in {:?}", s)));
        }
        Ok(CpuMax { quota_us, period_us })
    }
}

/// Where the resource groups live and what limits they carry.
#[derive(Debug, Clone)]
pub struct CgroupConfig {
    pub root: PathBuf,
    pub judge_name: String,
    pub player_name: String,
    /// Memory ceiling in MB; `None` leaves `memory.max` untouched.
    pub memory_limit_mb: Option<u64>,
    pub cpu_max: Option<CpuMax>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            judge_name: DEFAULT_JUDGE_CGROUP.to_string(),
            player_name: DEFAULT_PLAYER_CGROUP.to_string(),
            memory_limit_mb: Some(DEFAULT_MEMORY_LIMIT_MB),
            cpu_max: Some(CpuMax {
                quota_us: Some(100_000),
                period_us: 1_000_000,
            }),
        }
    }
}

/// Everything the controller needs to run one match.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub sandbox: SandboxConfig,
    pub cgroups: CgroupConfig,
    pub sample_interval: Duration,
    /// Binary re-invoked in bootstrap mode; the current executable when unset.
    pub controller_exe: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self {
            sandbox,
            cgroups: CgroupConfig::default(),
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            controller_exe: None,
        }
    }

    /// Reject parameters the run cannot start with. Called before any
    /// cgroup or process is created.
    pub fn validate(&self) -> Result<()> {
        let sb = &self.sandbox;
        if sb.judge_rootfs.as_os_str().is_empty() || sb.player_rootfs.as_os_str().is_empty() {
            return Err(Error::Config("must provide rootfs paths".to_string()));
        }
        if sb.judge_cmd.as_os_str().is_empty() || sb.player_cmd.as_os_str().is_empty() {
            return Err(Error::Config("must provide executable paths".to_string()));
        }
        if sb.timeout_ms == 0 {
            return Err(Error::Config("timeout must be greater than zero".to_string()));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::Config("sample interval must be greater than zero".to_string()));
        }

        let cg = &self.cgroups;
        for name in [&cg.judge_name, &cg.player_name] {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(Error::Config(format!("invalid cgroup name {:?}", name)));
            }
        }
        if cg.judge_name == cg.player_name {
            return Err(Error::Config(format!(
                "judge and player need distinct cgroups, both named {:?}",
                cg.judge_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> SandboxConfig {
        SandboxConfig {
            judge_rootfs: PathBuf::from("/srv/judge"),
            judge_cmd: PathBuf::from(DEFAULT_JUDGE_CMD),
            player_rootfs: PathBuf::from("/srv/player"),
            player_cmd: PathBuf::from(DEFAULT_PLAYER_CMD),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = RunConfig::new(sandbox());
        assert!(config.validate().is_ok());
        assert_eq!(config.sandbox.timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn missing_rootfs_is_rejected() {
        let mut config = RunConfig::new(sandbox());
        config.sandbox.player_rootfs = PathBuf::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rootfs"));
    }

    #[test]
    fn shared_cgroup_name_is_rejected() {
        let mut config = RunConfig::new(sandbox());
        config.cgroups.player_name = config.cgroups.judge_name.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn nested_cgroup_name_is_rejected() {
        let mut config = RunConfig::new(sandbox());
        config.cgroups.judge_name = "../escape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = RunConfig::new(sandbox());
        config.sandbox.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cpu_max_parses_quota_and_period() {
        let cpu: CpuMax = "100000 1000000".parse().unwrap();
        assert_eq!(cpu.quota_us, Some(100_000));
        assert_eq!(cpu.period_us, 1_000_000);
        assert_eq!(cpu.to_string(), "100000 1000000");
    }

    #[test]
    fn cpu_max_accepts_max_and_default_period() {
        let cpu: CpuMax = "max".parse().unwrap();
        assert_eq!(cpu.quota_us, None);
        assert_eq!(cpu.period_us, 100_000);
        assert_eq!(cpu.to_string(), "max 100000");
    }

    #[test]
    fn cpu_max_rejects_garbage() {
        assert!("".parse::<CpuMax>().is_err());
        assert!("fast 100".parse::<CpuMax>().is_err());
        assert!("100 200 300".parse::<CpuMax>().is_err());
        assert!("0 100000".parse::<CpuMax>().is_err());
    }
}
