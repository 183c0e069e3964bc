//! Runtime configuration.
//!
//! Configuration is read from the environment on first use and cached for the life
//! of the process:
//! - `VMSUBSTRATE_LOG`: minimum structured-log level (`trace`, `debug`, `info` (default),
//!   `warn`, `error`, `fatal`).
//! - `VMSUBSTRATE_TRACE`: comma separated trace channels (`threads`, `condition`, `tele`,
//!   `all`). Channel traces are emitted at `trace` level even when `VMSUBSTRATE_LOG` is
//!   stricter.
//! - `VMSUBSTRATE_TELE_MAX_HOPS`: upper bound on the number of registry entries a remote
//!   walk will visit before giving up.
//!
//! Embedders and tests can bypass the environment with [`install`].

use std::sync::OnceLock;

use crate::structured_log::LogLevel;

pub const ENV_LOG: &str = "VMSUBSTRATE_LOG";
pub const ENV_TRACE: &str = "VMSUBSTRATE_TRACE";
pub const ENV_TELE_MAX_HOPS: &str = "VMSUBSTRATE_TELE_MAX_HOPS";

/// Default bound on a remote registry walk.
pub const DEFAULT_TELE_MAX_HOPS: usize = 1 << 16;

/// Subsystems with an individually switchable trace channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceChannel {
    /// Thread create/run/attach/detach/join.
    Threads,
    /// Condition variable wait/notify.
    Condition,
    /// Remote introspection walks and copies.
    Tele,
}

impl TraceChannel {
    const fn bit(self) -> u8 {
        match self {
            Self::Threads => 0b001,
            Self::Condition => 0b010,
            Self::Tele => 0b100,
        }
    }

    /// Stable lowercase name, used as the `subsystem` of log entries.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Threads => "threads",
            Self::Condition => "condition",
            Self::Tele => "tele",
        }
    }
}

/// Set of enabled trace channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceChannels(u8);

impl TraceChannels {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b111);

    /// Parse a comma separated channel list. Unknown names are ignored.
    #[must_use]
    pub fn parse_loose(s: &str) -> Self {
        let mut set = Self::NONE;
        for name in s.split(',') {
            match name.trim().to_ascii_lowercase().as_str() {
                "threads" | "thread" => set = set.with(TraceChannel::Threads),
                "condition" | "cond" => set = set.with(TraceChannel::Condition),
                "tele" | "remote" => set = set.with(TraceChannel::Tele),
                "all" | "*" => set = Self::ALL,
                _ => {}
            }
        }
        set
    }

    #[must_use]
    pub const fn with(self, channel: TraceChannel) -> Self {
        Self(self.0 | channel.bit())
    }

    #[must_use]
    pub const fn contains(self, channel: TraceChannel) -> bool {
        self.0 & channel.bit() != 0
    }
}

/// Process-wide substrate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstrateConfig {
    pub log_level: LogLevel,
    pub trace: TraceChannels,
    pub tele_max_hops: usize,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            trace: TraceChannels::NONE,
            tele_max_hops: DEFAULT_TELE_MAX_HOPS,
        }
    }
}

impl SubstrateConfig {
    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Missing or unparseable values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let log_level = lookup(ENV_LOG)
            .map(|v| LogLevel::from_str_loose(&v))
            .unwrap_or(defaults.log_level);
        let trace = lookup(ENV_TRACE)
            .map(|v| TraceChannels::parse_loose(&v))
            .unwrap_or(defaults.trace);
        let tele_max_hops = lookup(ENV_TELE_MAX_HOPS)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&hops| hops > 0)
            .unwrap_or(defaults.tele_max_hops);
        Self {
            log_level,
            trace,
            tele_max_hops,
        }
    }

    /// Build a configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Returns true when `channel` traces are enabled.
    #[must_use]
    pub const fn traces(&self, channel: TraceChannel) -> bool {
        self.trace.contains(channel)
    }
}

static CONFIG: OnceLock<SubstrateConfig> = OnceLock::new();

/// Get the process configuration (reads the environment on first call).
#[must_use]
pub fn config() -> &'static SubstrateConfig {
    CONFIG.get_or_init(SubstrateConfig::from_env)
}

/// Install an explicit configuration.
///
/// Returns false if the configuration was already resolved, in which case the
/// existing value stays in effect.
pub fn install(config: SubstrateConfig) -> bool {
    CONFIG.set(config).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = SubstrateConfig::from_lookup(|_| None);
        assert_eq!(cfg, SubstrateConfig::default());
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert!(!cfg.traces(TraceChannel::Threads));
        assert_eq!(cfg.tele_max_hops, DEFAULT_TELE_MAX_HOPS);
    }

    #[test]
    fn parses_level_channels_and_hops() {
        let cfg = SubstrateConfig::from_lookup(lookup_from(&[
            (ENV_LOG, "WARN"),
            (ENV_TRACE, "threads, tele"),
            (ENV_TELE_MAX_HOPS, "128"),
        ]));
        assert_eq!(cfg.log_level, LogLevel::Warn);
        assert!(cfg.traces(TraceChannel::Threads));
        assert!(cfg.traces(TraceChannel::Tele));
        assert!(!cfg.traces(TraceChannel::Condition));
        assert_eq!(cfg.tele_max_hops, 128);
    }

    #[test]
    fn all_enables_every_channel() {
        let set = TraceChannels::parse_loose("all");
        assert_eq!(set, TraceChannels::ALL);
        assert!(set.contains(TraceChannel::Condition));
    }

    #[test]
    fn unknown_channels_and_bad_hops_are_ignored() {
        let cfg = SubstrateConfig::from_lookup(lookup_from(&[
            (ENV_TRACE, "bogus,,"),
            (ENV_TELE_MAX_HOPS, "0"),
        ]));
        assert_eq!(cfg.trace, TraceChannels::NONE);
        assert_eq!(cfg.tele_max_hops, DEFAULT_TELE_MAX_HOPS);
    }
}
