//! Config for the match runner behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional, and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `MATCH_VERBOSE`: Print match progress to stdout (default: `false`)
//! - `MATCH_LOG`: Enable logging to a file (default: `false`)
//! - `MATCH_ALLOW_UNCONTAINED`: Run agents without cgroup when one cannot be created (default: `true`)
//! - `MATCH_DEBUG_AGENT_STDERR`: Echo agent stderr on the runner's stderr (default: `false`)

/// Configuration for match runner behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_agent_stderr: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Nothing is printed to stdout.
    /// - Logging to file is disabled.
    /// - Agents fall back to plain processes if their cgroup cannot be created.
    /// - Agent stderr is recorded in the replay but not echoed.
    pub fn new() -> Self {
        Self {
            verbose: false,
            log: false,
            allow_uncontained: true,
            debug_agent_stderr: false,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// A set variable enables its flag only when its value is `"true"`. Unset variables keep
    /// the default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        Self {
            verbose: get_env_flag("MATCH_VERBOSE", false),
            log: get_env_flag("MATCH_LOG", false),
            allow_uncontained: get_env_flag("MATCH_ALLOW_UNCONTAINED", true),
            debug_agent_stderr: get_env_flag("MATCH_DEBUG_AGENT_STDERR", false),
        }
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable running agents without their cgroup.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable agent stderr output (debug purposes only).
    pub fn with_debug_agent_stderr(mut self, value: bool) -> Self {
        self.debug_agent_stderr = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_flags() {
        let config = Configuration::new()
            .with_verbose(true)
            .with_log(false)
            .with_allow_uncontained(false)
            .with_debug_agent_stderr(true);
        assert!(config.verbose);
        assert!(!config.log);
        assert!(!config.allow_uncontained);
        assert!(config.debug_agent_stderr);
        assert_eq!(Configuration::default(), Configuration::new());
    }
}
