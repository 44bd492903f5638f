// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Engine configuration from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::*;

pub const HOST_ENV: &str = "DBR_SERVER";
pub const AUTHFILE_ENV: &str = "DBR_AUTHFILE";
pub const TIMEOUT_ENV: &str = "DBR_TIMEOUT";
pub const RECONNECT_ENV: &str = "DBR_RECONNECT";
pub const PLUGIN_ENV: &str = "DBR_PLUGIN";

pub const DEFAULT_HOST: &str = "sock://localhost:6379";
pub const DEFAULT_AUTHFILE: &str = ".databroker.auth";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    /// `sock://host:port` endpoints; the first is the bootstrap node used
    /// for topology discovery.
    pub hosts: Vec<String>,

    /// Path of the one-line shared secret; empty disables AUTH.
    pub authfile: String,

    /// Per-operation timeout.
    pub timeout: Duration,

    /// Back-off between reconnect attempts for failed connections.
    pub reconnect: Duration,

    /// Optional data-adapter shared object. The engine records the path;
    /// loading it is the API layer's business.
    pub plugin: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            hosts: vec![DEFAULT_HOST.to_string()],
            authfile: DEFAULT_AUTHFILE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            reconnect: DEFAULT_RECONNECT,
            plugin: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let mut config = Config::default();

        if let Ok(hosts) = env::var(HOST_ENV) {
            let hosts: Vec<String> = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
            if !hosts.is_empty() {
                config.hosts = hosts;
            }
        }

        if let Ok(authfile) = env::var(AUTHFILE_ENV) {
            config.authfile = authfile;
        }

        config.timeout = seconds_from_env(TIMEOUT_ENV, DEFAULT_TIMEOUT);
        config.reconnect = seconds_from_env(RECONNECT_ENV, DEFAULT_RECONNECT);

        if let Ok(plugin) = env::var(PLUGIN_ENV) {
            config.plugin = Some(PathBuf::from(plugin));
        }

        config
    }

    /// The bootstrap endpoint.
    pub fn bootstrap(&self) -> &str {
        &self.hosts[0]
    }
}

fn seconds_from_env(name: &str, fallback: Duration) -> Duration {
    match env::var(name) {
        Ok(value) => match value.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!("{name}={value} is not a number of seconds, using default");
                fallback
            }
        },
        Err(_) => fallback,
    }
}

/// Strip the `sock://` scheme off an endpoint URL, leaving `host:port`.
pub fn host_of_url(url: &str) -> &str {
    url.strip_prefix("sock://").unwrap_or(url)
}
