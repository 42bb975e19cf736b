//! # Controller configuration
//!
//! This module handles the TOML configuration file for the controller.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// The toplevel config document.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigToplevel {
    /// The `[controller]` section.
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// The serialized `[controller]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ControllerConfig {
    /// Keep failed workers around for inspection.
    pub retain_failed_workers: bool,
    /// How many requests are reconciled at the same time.
    pub max_concurrent_reconciles: usize,
    /// How often a conflicting status write is retried.
    pub status_update_retries: u32,
    /// Upper bound on a single fetch, in seconds.
    pub fetch_timeout_secs: u64,
    /// Where the worker writes the image.
    pub destination_path: Utf8PathBuf,
    /// The image workers run.
    pub worker_image: String,
    /// Address upload workers receive their stream on.
    pub upload_listen: String,
    /// Region object storage requests are signed for.
    pub object_storage_region: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retain_failed_workers: true,
            max_concurrent_reconciles: 4,
            status_update_retries: 5,
            fetch_timeout_secs: 300,
            destination_path: "/data/disk.img".into(),
            worker_image: "quay.io/vmimport/importer:latest".into(),
            upload_listen: "0.0.0.0:8443".into(),
            object_storage_region: crate::transport::DEFAULT_REGION.into(),
        }
    }
}

impl ControllerConfig {
    /// The fetch timeout as a duration.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            anyhow::bail!("max-concurrent-reconciles must be at least 1");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch-timeout-secs must be at least 1");
        }
        if !self.destination_path.is_absolute() {
            anyhow::bail!(
                "destination-path must be absolute: {}",
                self.destination_path
            );
        }
        Ok(())
    }
}

/// Parse a configuration document.
pub fn parse_config(buf: &str) -> Result<ControllerConfig> {
    let c: ConfigToplevel = toml::from_str(buf)?;
    c.controller.validate()?;
    Ok(c.controller)
}

/// Load the configuration from `path`; a missing file yields the defaults.
#[context("Loading configuration")]
pub fn load_config(path: Option<&Utf8Path>) -> Result<ControllerConfig> {
    let Some(path) = path else {
        return Ok(Default::default());
    };
    let buf = match std::fs::read_to_string(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {path}, using defaults");
            return Ok(Default::default());
        }
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    parse_config(&buf).with_context(|| format!("Parsing {path}"))
}
