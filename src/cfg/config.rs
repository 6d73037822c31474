// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Resolve a config path given on the command line or in a test: relative
/// paths are anchored at the current working directory and canonicalized
/// so later error messages name the real file.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Default for the payload coalescing threshold (see
/// [`LimitsConfig::payload_coalesce_limit`]).
pub const DEFAULT_PAYLOAD_COALESCE_LIMIT: usize = 64 * 1024;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Where the export lives and what it is called.
    pub target: TargetConfig,
    /// Connection-count and flow limits enforced by the client.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Socket-level timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// Address of the NBD server and the export requested from it.
///
/// Exactly one of `address` (TCP `host:port`) or `unix` (socket path) must
/// be set. The export name is recorded for the caller's handshake layer;
/// the transmission engine itself never sends it.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TargetConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub unix: Option<PathBuf>,
    #[serde(default)]
    pub export: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LimitsConfig {
    /// Number of independent connections the pool opens to the export.
    #[serde(default = "default_max_connections")]
    pub max_connections: u16,

    /// Commands a single connection may keep in flight before the pool
    /// stops feeding it. The issue core itself is unbounded.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Write payloads strictly below this size keep the "more data
    /// follows" hint on when another command is queued behind them;
    /// larger payloads flush immediately.
    #[serde(default = "default_payload_coalesce_limit")]
    pub payload_coalesce_limit: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimeoutsConfig {
    /// Timeout for establishing the TCP or Unix-socket connection.
    #[serde(default = "default_connect_timeout", with = "serde_secs")]
    pub connect: Duration,
}

fn default_max_connections() -> u16 {
    1
}

fn default_max_in_flight() -> usize {
    16
}

fn default_payload_coalesce_limit() -> usize {
    DEFAULT_PAYLOAD_COALESCE_LIMIT
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_in_flight: default_max_in_flight(),
            payload_coalesce_limit: default_payload_coalesce_limit(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.target.address.is_some() || self.target.unix.is_some(),
            "either target.address or target.unix must be set"
        );
        ensure!(
            self.limits.max_connections >= 1,
            "limits.max_connections must be >= 1"
        );
        ensure!(
            self.limits.max_in_flight >= 1,
            "limits.max_in_flight must be >= 1"
        );
        ensure!(
            self.limits.payload_coalesce_limit >= 512,
            "limits.payload_coalesce_limit must be >= 512"
        );
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
