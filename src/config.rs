//! Pre-init configuration, mirroring the property-set key/value mechanism
//! callers used to tune the runtime before it was built.

use std::time::Duration;

const DEFAULT_RLIM_NOFILES: u64 = 1_048_576;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_WATCHDOG_SECS: u64 = 5;
const DEFAULT_BACKEND_NAME: &str = "mio";

/// Resolved runtime configuration. Build one with [`ConfigBuilder`] and pass
/// it to [`crate::runtime::Runtime::init`].
#[derive(Debug, Clone)]
pub struct Config {
    rlim_nofiles: u64,
    concurrency: usize,
    watchdog_timeout: Duration,
    backend_name: String,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn rlim_nofiles(&self) -> u64 {
        self.rlim_nofiles
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn watchdog_timeout(&self) -> Duration {
        self.watchdog_timeout
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rlim_nofiles: DEFAULT_RLIM_NOFILES,
            concurrency: DEFAULT_CONCURRENCY,
            watchdog_timeout: Duration::from_secs(DEFAULT_WATCHDOG_SECS),
            backend_name: DEFAULT_BACKEND_NAME.to_owned(),
        }
    }
}

/// Builder over [`Config`]'s recognized property-set keys: `rlim_nofiles`,
/// `concurrency`, watchdog timeout, and backend selection name.
#[derive(Debug, Default, Clone)]
pub struct ConfigBuilder {
    config: OverrideSet,
}

#[derive(Debug, Default, Clone)]
struct OverrideSet {
    rlim_nofiles: Option<u64>,
    concurrency: Option<usize>,
    watchdog_timeout: Option<Duration>,
    backend_name: Option<String>,
}

impl ConfigBuilder {
    /// Target open-file rlimit the runtime will try to raise to on init.
    /// Default 1,048,576.
    pub fn rlim_nofiles(mut self, value: u64) -> ConfigBuilder {
        self.config.rlim_nofiles = Some(value);
        self
    }

    /// Thread count for the default pool. Default 4.
    pub fn concurrency(mut self, value: usize) -> ConfigBuilder {
        assert!(value > 0, "concurrency must be at least 1");
        self.config.concurrency = Some(value);
        self
    }

    /// Per-pool watchdog deadman timeout. Default 5 seconds.
    pub fn watchdog_timeout(mut self, value: Duration) -> ConfigBuilder {
        self.config.watchdog_timeout = Some(value);
        self
    }

    /// Backend name, passed through to whatever `choose(name)`-style backend
    /// selection the embedding application performs. Default `"mio"`.
    pub fn backend_name(mut self, value: impl Into<String>) -> ConfigBuilder {
        self.config.backend_name = Some(value.into());
        self
    }

    pub fn build(self) -> Config {
        let defaults = Config::default();
        Config {
            rlim_nofiles: self.config.rlim_nofiles.unwrap_or(defaults.rlim_nofiles),
            concurrency: self.config.concurrency.unwrap_or(defaults.concurrency),
            watchdog_timeout: self.config.watchdog_timeout.unwrap_or(defaults.watchdog_timeout),
            backend_name: self.config.backend_name.unwrap_or(defaults.backend_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.rlim_nofiles(), 1_048_576);
        assert_eq!(c.concurrency(), 4);
        assert_eq!(c.backend_name(), "mio");
    }

    #[test]
    fn builder_overrides_only_the_keys_set() {
        let c = Config::builder().concurrency(8).build();
        assert_eq!(c.concurrency(), 8);
        assert_eq!(c.rlim_nofiles(), 1_048_576);
    }

    #[test]
    #[should_panic(expected = "concurrency must be at least 1")]
    fn zero_concurrency_is_rejected() {
        Config::builder().concurrency(0);
    }
}
