// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use anyhow::{Context, Result};
use nbd_client_rs::cfg::logger::init_logger;

/// Boots the logger from a YAML config with a file writer, emits an
/// event through `tracing`, and checks it lands in the file once the
/// worker guard flushes.
///
/// This is the only test in the binary that installs a global
/// subscriber; `init_logger` would fail if called twice in one process.
#[test]
fn init_logger_writes_through_configured_file() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("nbd-client-rs-log-{}", std::process::id()));
    fs::create_dir_all(&dir)?;
    let log_path = dir.join("engine.log");
    let cfg_path = dir.join("logger.yaml");

    fs::write(
        &cfg_path,
        format!(
            r#"
logger:
  level: debug
  output: file
  file:
    path: {}
"#,
            log_path.display()
        ),
    )?;

    let guard = init_logger(cfg_path.to_str().context("non-utf8 temp path")?)?;
    tracing::info!("logger smoke line");
    // Dropping the guard flushes the non-blocking writer.
    drop(guard);

    let written = fs::read_to_string(&log_path)?;
    assert!(
        written.contains("logger smoke line"),
        "log file did not contain the event: {written:?}"
    );

    fs::remove_dir_all(&dir)?;
    Ok(())
}
