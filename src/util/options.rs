//! Runtime configuration, read from `GCHEAP_*` environment variables at
//! init time.

use std::str::FromStr;

/// Prefix for environment variable overrides, e.g. `GCHEAP_GC_INTERVAL_MS`.
const ENV_PREFIX: &str = "GCHEAP_";

#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// The quiescent interval after which the collector thread forces a
    /// cycle, on top of trigger-by-demand.
    pub gc_interval_ms: u64,
    /// Whether to run the dedicated collector thread at all. Hosts that
    /// drive cycles themselves (and the test suites) turn this off.
    pub collector_thread: bool,
    /// Whether timer-forced cycles collect the old generation too.
    pub full_gc_default: bool,
    /// Upper bound on pages a thread caches per size class.
    pub cached_pages_per_class: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            gc_interval_ms: 10_000,
            collector_thread: true,
            full_gc_default: true,
            cached_pages_per_class: 8,
        }
    }
}

impl Options {
    /// Built-in defaults overridden by any `GCHEAP_*` variables present in
    /// the environment. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut options = Options::default();
        options.read_env_var_settings();
        options
    }

    fn read_env_var_settings(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                if !self.set_from_str(&name.to_lowercase(), &value) {
                    log::warn!("ignoring unrecognized option {}={}", key, value);
                }
            }
        }
    }

    /// Sets a single option from its string form. Returns false if the name
    /// is unknown or the value does not parse.
    pub fn set_from_str(&mut self, name: &str, value: &str) -> bool {
        match name {
            "gc_interval_ms" => parse_into(&mut self.gc_interval_ms, value),
            "collector_thread" => parse_into(&mut self.collector_thread, value),
            "full_gc_default" => parse_into(&mut self.full_gc_default, value),
            "cached_pages_per_class" => parse_into(&mut self.cached_pages_per_class, value),
            _ => false,
        }
    }
}

fn parse_into<T: FromStr>(slot: &mut T, value: &str) -> bool {
    match value.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.gc_interval_ms, 10_000);
        assert!(options.collector_thread);
        assert_eq!(options.cached_pages_per_class, 8);
    }

    #[test]
    fn set_from_str() {
        let mut options = Options::default();
        assert!(options.set_from_str("gc_interval_ms", "250"));
        assert_eq!(options.gc_interval_ms, 250);
        assert!(options.set_from_str("collector_thread", "false"));
        assert!(!options.collector_thread);
        assert!(!options.set_from_str("collector_thread", "maybe"));
        assert!(!options.set_from_str("no_such_option", "1"));
    }
}
