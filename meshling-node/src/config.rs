//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use meshling_core::EvictionPolicy;

/// Node configuration. File: ~/.config/meshling/config.toml or
/// /etc/meshling/config.toml. Env overrides: MESHLING_MAX_CLIENTS,
/// MESHLING_EVICTION, MESHLING_SIM_PEERS, MESHLING_PROBE_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Client registry capacity (default 32).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Behavior on a full registry: "reject-new" or "least-recently-seen".
    #[serde(default = "default_eviction")]
    pub eviction: String,
    /// Number of simulated probing peers (default 3).
    #[serde(default = "default_sim_peers")]
    pub sim_peers: usize,
    /// Interval between simulated probes in milliseconds (default 2000).
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_max_clients() -> usize {
    meshling_core::MAX_CLIENTS
}
fn default_eviction() -> String {
    "reject-new".to_string()
}
fn default_sim_peers() -> usize {
    3
}
fn default_probe_interval_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            eviction: default_eviction(),
            sim_peers: default_sim_peers(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl Config {
    /// Map the eviction setting onto the registry policy. Unknown values
    /// fall back to rejecting new peers.
    pub fn eviction_policy(&self) -> EvictionPolicy {
        match self.eviction.as_str() {
            "least-recently-seen" => EvictionPolicy::LeastRecentlySeen,
            "reject-new" => EvictionPolicy::RejectNew,
            other => {
                tracing::warn!(eviction = other, "unknown eviction policy; rejecting new peers");
                EvictionPolicy::RejectNew
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("MESHLING_MAX_CLIENTS") {
        if let Ok(n) = s.parse::<usize>() {
            c.max_clients = n;
        }
    }
    if let Ok(s) = std::env::var("MESHLING_EVICTION") {
        c.eviction = s;
    }
    if let Ok(s) = std::env::var("MESHLING_SIM_PEERS") {
        if let Ok(n) = s.parse::<usize>() {
            c.sim_peers = n;
        }
    }
    if let Ok(s) = std::env::var("MESHLING_PROBE_INTERVAL_MS") {
        if let Ok(n) = s.parse::<u64>() {
            c.probe_interval_ms = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshling/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshling/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
