//! Per-turn time limits and per-agent resource limits.
//!
//! The main entry point is the [`ConstraintsBuilder`], which produces validated
//! [`Constraints`]:
//!
//! - **Timing**: the time an agent may take to answer one turn, with a separate (usually
//!   larger) limit for its very first turn, when it may still be loading.
//! - **Memory**: RAM per external agent, in MB.
//! - **CPUs**: which logical CPUs external agents may run on, as a list like `"0-3,6"`.
//!
//! Memory and CPU limits are enforced with Linux cgroups v2. Without them, agents run as
//! plain processes and only timing is constrained.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use agent_arena::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_action_timeout(Duration::from_millis(50))
//!     .with_first_action_timeout(Duration::from_secs(1))
//!     .build()
//!     .unwrap();
//! assert_eq!(constraints.action_timeout(), Duration::from_millis(50));
//! ```

use std::{collections::BTreeSet, env, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(1);

/// A chainable builder for [`Constraints`].
///
/// By default turns time out after one second and no memory or CPU limit applies.
#[derive(Debug, Default)]
pub struct ConstraintsBuilder {
    action_timeout: Option<Duration>,
    first_action_timeout: Option<Duration>,
    agent_ram: Option<usize>,
    cpu_list: Option<String>,
}

impl ConstraintsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `ACTION_TIMEOUT_MS` (u64): timeout per turn in milliseconds
    /// - `FIRST_ACTION_TIMEOUT_MS` (u64): timeout of an agent's first turn in milliseconds
    /// - `RAM_PER_AGENT` (usize): maximum RAM per agent in MB
    /// - `CPU_LIST` (string): comma-separated list or ranges of CPUs, e.g. "0-3,6"
    ///
    /// Unset or unparsable variables leave the default in place.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_millis(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_millis)
        }

        ConstraintsBuilder {
            action_timeout: parse_duration_millis("ACTION_TIMEOUT_MS"),
            first_action_timeout: parse_duration_millis("FIRST_ACTION_TIMEOUT_MS"),
            agent_ram: parse_usize("RAM_PER_AGENT"),
            cpu_list: env::var("CPU_LIST").ok(),
        }
    }

    /// Maximum time an agent may take to answer one turn.
    #[must_use]
    pub fn with_action_timeout(self, duration: Duration) -> Self {
        Self {
            action_timeout: Some(duration),
            ..self
        }
    }

    /// Maximum time for an agent's first turn. Defaults to the action timeout.
    #[must_use]
    pub fn with_first_action_timeout(self, duration: Duration) -> Self {
        Self {
            first_action_timeout: Some(duration),
            ..self
        }
    }

    /// Sets the maximum RAM available per external agent (in MB).
    #[must_use]
    pub fn with_ram_per_agent(self, max: usize) -> Self {
        Self {
            agent_ram: Some(max),
            ..self
        }
    }

    /// Restricts external agents to the given CPUs.
    ///
    /// Format follows the pattern: `"0-3,6,8"` (inclusive ranges and individual IDs).
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpu_list: Some(cpus.to_string()),
            ..self
        }
    }

    /// Consumes the builder and returns the validated [`Constraints`].
    ///
    /// # Errors
    ///
    /// Returns an error when a timeout is zero, when the RAM per agent exceeds the memory
    /// currently available, or when the CPU list is malformed or names a CPU this machine
    /// does not have.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let action_timeout = self.action_timeout.unwrap_or(DEFAULT_ACTION_TIMEOUT);
        let first_action_timeout = self.first_action_timeout.unwrap_or(action_timeout);
        if action_timeout.is_zero() || first_action_timeout.is_zero() {
            bail!("turn timeouts must be greater than zero");
        }

        let agent_ram = match self.agent_ram {
            Some(0) => bail!("RAM per agent must be greater than zero"),
            Some(mb) => {
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                let available = sys.available_memory() as usize;
                let Some(wanted) = mb.checked_mul(1_000_000) else {
                    bail!("Agent RAM size ({mb}MB) is out of range");
                };
                if available > 0 && wanted > available {
                    bail!(
                        "Agent RAM size ({mb}MB) is greater than available RAM ({}MB)",
                        available / 1_000_000
                    );
                }
                Some(wanted)
            }
            None => None,
        };

        let cpus = match self.cpu_list {
            Some(list) => {
                let cpus = cpu_list_to_set(&list)
                    .with_context(|| format!("invalid cpu list '{list}'"))?;
                let count = num_cpus::get();
                if let Some(cpu) = cpus.iter().find(|&&cpu| usize::from(cpu) >= count) {
                    bail!("cpu {cpu} does not exist (only {count} logical cpus)");
                }
                Some(cpus)
            }
            None => None,
        };

        if (agent_ram.is_some() || cpus.is_some()) && !cfg!(target_os = "linux") {
            warn!("memory and cpu limits are only enforced on linux");
        }
        Ok(Constraints {
            action_timeout,
            first_action_timeout,
            agent_ram,
            cpus,
        })
    }
}

fn cpu_list_to_set(s: &str) -> anyhow::Result<BTreeSet<u8>> {
    if s.is_empty() {
        bail!("Empty string");
    }
    let mut set = BTreeSet::new();
    for item in s.split(',') {
        let bounds = item
            .split('-')
            .map(|value| {
                value
                    .trim()
                    .parse::<u8>()
                    .with_context(|| format!("could not parse {value}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        match bounds[..] {
            [single] => {
                set.insert(single);
            }
            [start, end] => set.extend(start.min(end)..=start.max(end)),
            _ => bail!(
                "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
            ),
        }
    }
    Ok(set)
}

/// Obtained using [`ConstraintsBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    action_timeout: Duration,
    first_action_timeout: Duration,
    agent_ram: Option<usize>,
    cpus: Option<BTreeSet<u8>>,
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    pub fn action_timeout(&self) -> Duration {
        self.action_timeout
    }

    pub fn first_action_timeout(&self) -> Duration {
        self.first_action_timeout
    }

    /// Timeout applying to an agent's turn number `turn` (0 is its first turn).
    pub fn turn_timeout(&self, turn: usize) -> Duration {
        if turn == 0 {
            self.first_action_timeout
        } else {
            self.action_timeout
        }
    }

    /// RAM per agent in bytes, if limited.
    pub fn agent_ram(&self) -> Option<usize> {
        self.agent_ram
    }

    /// Whether external agents should be launched inside a cgroup.
    pub(crate) fn needs_container(&self) -> bool {
        self.agent_ram.is_some() || self.cpus.is_some()
    }

    /// CPU list in cgroup format ("0,1,4"), empty when unrestricted.
    pub(crate) fn cpus_string(&self) -> String {
        self.cpus
            .iter()
            .flatten()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            first_action_timeout: DEFAULT_ACTION_TIMEOUT,
            agent_ram: None,
            cpus: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let constraints = ConstraintsBuilder::new().build().unwrap();
        assert_eq!(constraints, Constraints::default());
        assert!(!constraints.needs_container());
        assert_eq!(constraints.cpus_string(), "");
    }

    #[test]
    fn first_turn_timeout() {
        let constraints = ConstraintsBuilder::new()
            .with_action_timeout(Duration::from_millis(50))
            .with_first_action_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        assert_eq!(constraints.turn_timeout(0), Duration::from_millis(500));
        assert_eq!(constraints.turn_timeout(1), Duration::from_millis(50));
        assert_eq!(constraints.turn_timeout(7), Duration::from_millis(50));
    }

    #[test]
    fn first_turn_defaults_to_action_timeout() {
        let constraints = ConstraintsBuilder::new()
            .with_action_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        assert_eq!(constraints.first_action_timeout(), Duration::from_millis(20));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(ConstraintsBuilder::new()
            .with_action_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn cpu_list_parsing() {
        assert_eq!(
            cpu_list_to_set("0-2,5").unwrap(),
            BTreeSet::from([0, 1, 2, 5])
        );
        assert_eq!(cpu_list_to_set("3-1").unwrap(), BTreeSet::from([1, 2, 3]));
        assert!(cpu_list_to_set("").is_err());
        assert!(cpu_list_to_set("1-2-3").is_err());
        assert!(cpu_list_to_set("a").is_err());
    }

    #[test]
    fn cpu_zero_always_exists() {
        let constraints = ConstraintsBuilder::new().with_cpu_list("0").build().unwrap();
        assert!(constraints.needs_container());
        assert_eq!(constraints.cpus_string(), "0");
    }

    #[test]
    fn huge_ram_is_rejected() {
        let error = ConstraintsBuilder::new()
            .with_ram_per_agent(usize::MAX)
            .build()
            .unwrap_err();
        assert!(error.to_string().contains("out of range"));
    }

    #[test]
    fn missing_cpu_is_rejected() {
        assert!(ConstraintsBuilder::new()
            .with_cpu_list("255")
            .build()
            .is_err());
    }
}
