// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use nbd_client_rs::cfg::config::{Config, resolve_config_path};

#[test]
fn config_loads_from_fixture() -> Result<()> {
    let cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    assert_eq!(cfg.target.address.as_deref(), Some("127.0.0.1:10809"));
    assert_eq!(cfg.target.export, "disk0");
    assert_eq!(cfg.limits.max_connections, 2);
    assert_eq!(cfg.limits.max_in_flight, 16);
    assert_eq!(cfg.limits.payload_coalesce_limit, 65536);
    assert_eq!(cfg.timeouts.connect, Duration::from_secs(5));

    Ok(())
}

#[test]
fn config_defaults_apply() -> Result<()> {
    let cfg: Config = serde_yaml::from_str(
        r#"
target:
  unix: /run/nbd.sock
"#,
    )?;
    cfg.validate()?;

    assert!(cfg.target.address.is_none());
    assert_eq!(cfg.limits.max_connections, 1);
    assert_eq!(cfg.limits.max_in_flight, 16);
    assert_eq!(cfg.limits.payload_coalesce_limit, 64 * 1024);
    assert_eq!(cfg.timeouts.connect, Duration::from_secs(30));

    Ok(())
}

#[test]
fn config_requires_a_target() -> Result<()> {
    let cfg: Config = serde_yaml::from_str("target: {}\n")?;
    assert!(cfg.validate().is_err());
    Ok(())
}

#[test]
fn config_rejects_zero_limits() -> Result<()> {
    let cfg: Config = serde_yaml::from_str(
        r#"
target:
  address: "127.0.0.1:10809"
limits:
  max_in_flight: 0
"#,
    )?;
    assert!(cfg.validate().is_err());

    let cfg: Config = serde_yaml::from_str(
        r#"
target:
  address: "127.0.0.1:10809"
limits:
  payload_coalesce_limit: 16
"#,
    )?;
    assert!(cfg.validate().is_err());

    Ok(())
}
