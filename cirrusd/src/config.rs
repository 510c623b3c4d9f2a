use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::sync::watcher::default_excluded_dirs;

const DEFAULT_BASE_DIR_NAME: &str = "Cirrus Drive";
const DEFAULT_MAX_TRANSFERS: u64 = 50;
const DEFAULT_DEBOUNCE_MS: u64 = 1000;
const DEFAULT_ECHO_TTL_SECS: u64 = 7200;
const DEFAULT_INTERVAL_SECS: u64 = 300;
const DEFAULT_BACKGROUND_INTERVAL_SECS: u64 = 120;
const DEFAULT_LARGE_FILE_MIB: u64 = 3;
const DEFAULT_SETTLE_DELAY_MS: u64 = 2000;
const DEFAULT_PASS_DEADLINE_SECS: u64 = 3 * 3600;
const DEFAULT_START_GRACE_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub base_url: Option<String>,
    pub sync_root: PathBuf,
    pub workspace_id: Option<i64>,
    pub max_concurrent_transfers: usize,
    pub debounce: Duration,
    pub echo_ttl: Duration,
    pub periodic_interval: Duration,
    pub excluded_dir_names: HashSet<String>,
    pub large_file_threshold: u64,
    pub settle_delay: Duration,
    pub pass_deadline: Duration,
    pub start_grace: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let default_root = home.join(DEFAULT_BASE_DIR_NAME);
        let sync_root = std::env::var("CIRRUS_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or(default_root);

        let base_url = std::env::var("CIRRUS_BASE_URL").ok();
        let workspace_id = std::env::var("CIRRUS_WORKSPACE_ID")
            .ok()
            .and_then(|value| value.parse::<i64>().ok());

        let background = read_bool_env("CIRRUS_BACKGROUND", false);
        let default_interval = if background {
            DEFAULT_BACKGROUND_INTERVAL_SECS
        } else {
            DEFAULT_INTERVAL_SECS
        };
        let periodic_interval = Duration::from_secs(read_u64_env(
            "CIRRUS_SYNC_INTERVAL_SECS",
            default_interval,
        ));

        let excluded_dir_names = match std::env::var("CIRRUS_EXCLUDED_DIRS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => default_excluded_dirs(),
        };

        Ok(Self {
            base_url,
            sync_root,
            workspace_id,
            max_concurrent_transfers: read_u64_env("CIRRUS_MAX_TRANSFERS", DEFAULT_MAX_TRANSFERS)
                as usize,
            debounce: Duration::from_millis(read_u64_env(
                "CIRRUS_DEBOUNCE_MS",
                DEFAULT_DEBOUNCE_MS,
            )),
            echo_ttl: Duration::from_secs(read_u64_env(
                "CIRRUS_ECHO_TTL_SECS",
                DEFAULT_ECHO_TTL_SECS,
            )),
            periodic_interval,
            excluded_dir_names,
            large_file_threshold: read_u64_env("CIRRUS_LARGE_FILE_MIB", DEFAULT_LARGE_FILE_MIB)
                * 1024
                * 1024,
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            pass_deadline: Duration::from_secs(DEFAULT_PASS_DEADLINE_SECS),
            start_grace: Duration::from_secs(DEFAULT_START_GRACE_SECS),
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
