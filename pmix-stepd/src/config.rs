//! Plugin configuration.
//!
//! Values come from three layers applied in order: built-in defaults,
//! `mpi.conf` style `Key=Value` pairs, then `SLURM_PMIX_*` environment
//! overrides from the job environment.

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::path::PathBuf;
use std::time::Duration;

bitflags! {
    /// Boolean policies.
    pub struct Policy: u32 {
        const DIRECT_CONN = 1 << 0;
        const DIRECT_CONN_EARLY = 1 << 1;
        const DIRECT_CONN_UCX = 1 << 2;
        const SAME_ARCH = 1 << 3;
        const FENCE_BARRIER = 1 << 4;
        const PINGPONG = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceAlgo {
    /// Tree for barriers and empty contributions, ring otherwise.
    Auto,
    Tree,
    Ring,
}

impl std::str::FromStr for FenceAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "mixed" => Ok(Self::Auto),
            "tree" => Ok(Self::Tree),
            "ring" => Ok(Self::Ring),
            _ => Err(Error::BadParam(format!("unknown fence algorithm {:?}", s))),
        }
    }
}

/// Backoff schedule for sends over the launcher's forwarding RPC.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt; doubled after every failure.
    pub start_delay: Duration,
    /// Total number of attempts.
    pub retries: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(500),
            retries: 7,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.start_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Parent of the per-step library directory. Falls back to the job's
    /// `TMPDIR`, then `/tmp`.
    pub tmpdir_base: Option<PathBuf>,
    pub fence: FenceAlgo,
    pub policy: Policy,
    /// Stale threshold for collectives and direct modex requests.
    pub timeout: Duration,
    /// PMIx library verbosity; also selects the plugin's own log level.
    pub debug: u32,
    /// Fan-out of the tree collective.
    pub tree_width: u32,
    /// Extra `NAME=value` pairs exported to every client.
    pub env: Vec<(String, String)>,
    pub net_devices: Option<String>,
    pub tls: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmpdir_base: None,
            fence: FenceAlgo::Auto,
            policy: Policy::DIRECT_CONN | Policy::SAME_ARCH,
            timeout: Duration::from_secs(300),
            debug: 0,
            tree_width: 16,
            env: Vec::new(),
            net_devices: None,
            tls: None,
            retry: RetryPolicy::default(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "y" | "on" => Ok(true),
        "0" | "no" | "false" | "n" | "off" => Ok(false),
        _ => Err(Error::BadParam(format!("{}: expected a boolean, got {:?}", key, value))),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::BadParam(format!("{}: expected a number, got {:?}", key, value)))
}

// "A=1;B=2" into pairs; entries without '=' are ignored
fn parse_env(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|entry| entry.trim().split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fence(mut self, fence: FenceAlgo) -> Self {
        self.fence = fence;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tree_width(mut self, width: u32) -> Self {
        self.tree_width = width.max(1);
        self
    }

    pub fn with_tmpdir_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.tmpdir_base = Some(base.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_debug(mut self, debug: u32) -> Self {
        self.debug = debug;
        self
    }

    /// Sets or clears `flag`.
    pub fn with_policy(mut self, flag: Policy, on: bool) -> Self {
        self.policy.set(flag, on);
        self
    }

    pub fn direct_conn(&self) -> bool {
        self.policy.contains(Policy::DIRECT_CONN)
    }

    pub fn same_arch(&self) -> bool {
        self.policy.contains(Policy::SAME_ARCH)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Applies `mpi.conf` keys on top of the defaults. Unknown keys are
    /// rejected so typos do not silently fall back to defaults.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in pairs {
            let key = key.trim();
            match key {
                "PMIxCliTmpDirBase" => config.tmpdir_base = Some(PathBuf::from(value.trim())),
                "PMIxCollFence" => config.fence = value.trim().parse()?,
                "PMIxDebug" => config.debug = parse_u32(key, value)?,
                "PMIxDirectConn" => config.policy.set(Policy::DIRECT_CONN, parse_bool(key, value)?),
                "PMIxDirectConnEarly" => {
                    config.policy.set(Policy::DIRECT_CONN_EARLY, parse_bool(key, value)?)
                }
                "PMIxDirectConnUCX" => {
                    config.policy.set(Policy::DIRECT_CONN_UCX, parse_bool(key, value)?)
                }
                "PMIxDirectSameArch" => config.policy.set(Policy::SAME_ARCH, parse_bool(key, value)?),
                "PMIxEnv" => config.env = parse_env(value),
                "PMIxFenceBarrier" => {
                    config.policy.set(Policy::FENCE_BARRIER, parse_bool(key, value)?)
                }
                "PMIxNetDevicesUCX" => config.net_devices = Some(value.trim().to_string()),
                "PMIxTimeout" => {
                    config.timeout = Duration::from_secs(parse_u32(key, value)?.into())
                }
                "PMIxTlsUCX" => config.tls = Some(value.trim().to_string()),
                _ => return Err(Error::BadParam(format!("unknown configuration key {:?}", key))),
            }
        }
        Ok(config)
    }

    /// Applies `SLURM_PMIX_*` overrides found in `vars`, usually the job's
    /// environment.
    pub fn apply_env<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "SLURM_PMIX_TMPDIR" => self.tmpdir_base = Some(PathBuf::from(value)),
                "SLURM_PMIX_FENCE" => self.fence = value.parse()?,
                "SLURM_PMIX_DEBUG" => self.debug = parse_u32(key, value)?,
                "SLURM_PMIX_DIRECT_CONN" => {
                    self.policy.set(Policy::DIRECT_CONN, parse_bool(key, value)?)
                }
                "SLURM_PMIX_DIRECT_CONN_EARLY" => {
                    self.policy.set(Policy::DIRECT_CONN_EARLY, parse_bool(key, value)?)
                }
                "SLURM_PMIX_DIRECT_CONN_UCX" => {
                    self.policy.set(Policy::DIRECT_CONN_UCX, parse_bool(key, value)?)
                }
                "SLURM_PMIX_DIRECT_SAMEARCH" => {
                    self.policy.set(Policy::SAME_ARCH, parse_bool(key, value)?)
                }
                "SLURM_PMIX_FENCE_BARRIER" => {
                    self.policy.set(Policy::FENCE_BARRIER, parse_bool(key, value)?)
                }
                "SLURM_PMIX_TIMEOUT" => {
                    self.timeout = Duration::from_secs(parse_u32(key, value)?.into())
                }
                "SLURM_PMIX_WANT_PP" => self.policy.set(Policy::PINGPONG, parse_bool(key, value)?),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::config::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(config.direct_conn());
        assert!(config.same_arch());
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.fence, FenceAlgo::Auto);
        assert_eq!(config.log_level(), log::LevelFilter::Warn);
    }

    #[test]
    fn conf_then_env() {
        let mut config = Config::from_pairs([
            ("PMIxCollFence", "ring"),
            ("PMIxDirectConn", "no"),
            ("PMIxTimeout", "30"),
            ("PMIxEnv", "OMPI_MCA_x=1; FOO=bar=baz;junk"),
            ("PMIxDebug", "2"),
        ])
        .unwrap();
        assert_eq!(config.fence, FenceAlgo::Ring);
        assert!(!config.direct_conn());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(
            config.env,
            vec![
                ("OMPI_MCA_x".to_string(), "1".to_string()),
                ("FOO".to_string(), "bar=baz".to_string())
            ]
        );

        config
            .apply_env([
                ("SLURM_PMIX_FENCE", "mixed"),
                ("SLURM_PMIX_DIRECT_CONN", "1"),
                ("SLURM_PMIX_WANT_PP", "yes"),
                ("HOME", "/root"),
            ])
            .unwrap();
        assert_eq!(config.fence, FenceAlgo::Auto);
        assert!(config.direct_conn());
        assert!(config.policy.contains(Policy::PINGPONG));
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Config::from_pairs([("PMIxBogus", "1")]).is_err());
        assert!(Config::from_pairs([("PMIxDirectConn", "maybe")]).is_err());
        assert!(Config::default().apply_env([("SLURM_PMIX_TIMEOUT", "soon")]).is_err());
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay(0), Duration::from_millis(500));
        assert_eq!(retry.delay(2), Duration::from_secs(2));
        assert_eq!(retry.delay(4), Duration::from_secs(5));
        assert_eq!(retry.delay(40), Duration::from_secs(5));
    }
}
