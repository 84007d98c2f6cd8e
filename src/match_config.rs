//! Seed, game parameters and game mode of a match.
//!
//! These are fixed before the match starts and rendered into the initialization
//! [`CommandBuffer`] handed to the referee: the seed line first (if any), then one
//! `key=value` line per parameter, in insertion order.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::command::{CommandBuffer, MalformedLineError};

/// Whether the match opposes several agents or a single agent plays alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    /// One agent, puzzle-like games.
    Solo,
    /// One or more agents competing.
    #[default]
    Multi,
}

impl Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameMode::Solo => write!(f, "solo"),
            GameMode::Multi => write!(f, "multi"),
        }
    }
}

/// Free-form game parameters with unique keys, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameParameters {
    entries: Vec<(String, String)>,
}

impl GameParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`. An existing key keeps its position and gets the new value.
    ///
    /// # Errors
    /// The rendered `key=value` line must be a valid protocol line, and `key` must not
    /// contain `'='` (the referee splits on the first one).
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, MalformedLineError> {
        let key = key.into();
        let value = value.into();
        if key.contains(['=', '\n', '\r']) || value.contains(['\n', '\r']) {
            return Err(MalformedLineError {
                line: format!("{key}={value}"),
            });
        }
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> TryFrom<Vec<(K, V)>> for GameParameters {
    type Error = MalformedLineError;

    fn try_from(pairs: Vec<(K, V)>) -> Result<Self, Self::Error> {
        let mut params = GameParameters::new();
        for (k, v) in pairs {
            params.insert(k, v)?;
        }
        Ok(params)
    }
}

/// Everything about a match except its roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchConfig {
    pub seed: Option<i64>,
    pub parameters: GameParameters,
    pub mode: GameMode,
}

impl MatchConfig {
    /// Builds the buffer sent to the referee on initialization.
    pub fn init_command(&self) -> Result<CommandBuffer, MalformedLineError> {
        let mut init = CommandBuffer::new();
        if let Some(seed) = self.seed {
            init.add_line(format!("seed={seed}"))?;
        }
        for (key, value) in self.parameters.iter() {
            init.add_line(format!("{key}={value}"))?;
        }
        Ok(init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_comes_first() {
        let config = MatchConfig {
            seed: Some(42),
            parameters: vec![("width", "10"), ("height", "5")].try_into().unwrap(),
            mode: GameMode::Multi,
        };
        let init = config.init_command().unwrap();
        assert_eq!(init.lines(), ["seed=42", "width=10", "height=5"]);
    }

    #[test]
    fn no_seed_no_seed_line() {
        let config = MatchConfig {
            parameters: vec![("width", "10")].try_into().unwrap(),
            ..Default::default()
        };
        assert_eq!(config.init_command().unwrap().lines(), ["width=10"]);
        assert!(MatchConfig::default().init_command().unwrap().is_empty());
    }

    #[test]
    fn duplicate_key_keeps_one_line() {
        let mut params = GameParameters::new();
        params.insert("a", "1").unwrap();
        params.insert("b", "2").unwrap();
        params.insert("a", "3").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("a"), Some("3"));
        assert_eq!(
            params.iter().collect::<Vec<_>>(),
            vec![("a", "3"), ("b", "2")]
        );
    }

    #[test]
    fn rejects_unrenderable_parameters() {
        let mut params = GameParameters::new();
        assert!(params.insert("a=b", "1").is_err());
        assert!(params.insert("a", "multi\nline").is_err());
        assert!(params.insert("key", "x=y").is_ok());
    }
}
