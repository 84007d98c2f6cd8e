//! # Agent Arena
//!
//! A local runner for turn-based games played by automated agents.
//!
//! It provides:
//! - Agents running either as external executables, spoken to line by line over their
//!   stdin/stdout, or as in-process [`TurnHandler`](crate::agent::TurnHandler)s
//! - A [`MatchRunner`](crate::match_runner::MatchRunner) driving one match under a
//!   [`Referee`](crate::game_interface::Referee), the game logic you provide
//! - Per-turn timeouts, and memory/CPU limits enforced through Linux cgroups v2
//! - A [`Replay`](crate::recorder::Replay) of every completed match, one frame per step
//!
//! # Documentation Overview
//!
//! - For the match lifecycle, see the [`match_runner`] module.
//! - For the game side, see the [`Referee`](crate::game_interface::Referee) trait.
//! - For the agent protocol and failure kinds, see the [`agent`] and [`command`] modules.
//! - For limits and execution environment, see [`constraints`] and
//!   [`Configuration`](crate::configuration::Configuration).
//!
//! # Usage Example
//!
//! ```no_run
//! # struct YourReferee;
//! # impl agent_arena::game_interface::Referee for YourReferee {
//! #     fn initialize(&mut self, _: &agent_arena::command::CommandBuffer, _: &[PlayerInfo], _: GameMode) -> anyhow::Result<i64> { Ok(0) }
//! #     fn next_action(&mut self) -> anyhow::Result<Action> { Ok(Action::Done(vec![])) }
//! #     fn report_turn_result(&mut self, _: usize, _: agent_arena::game_interface::TurnResult) -> anyhow::Result<()> { Ok(()) }
//! #     fn end_step(&mut self) -> anyhow::Result<agent_arena::game_interface::StepView> { Ok(Default::default()) }
//! # }
//! use std::time::Duration;
//! use agent_arena::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let constraints = ConstraintsBuilder::new()
//!         .with_action_timeout(Duration::from_millis(50))
//!         .with_first_action_timeout(Duration::from_secs(1))
//!         .build()?;
//!     let config = Configuration::new().with_verbose(true);
//!
//!     let mut runner = MatchRunner::new(config, constraints);
//!     runner.register_agent(AgentSpec::command_line("./bot --fast"), Some("bot"), None)?;
//!     runner.register_agent(AgentSpec::command_line("python3 other.py"), None, None)?;
//!     runner.set_seed(42)?;
//!
//!     let outcome = runner.start(&mut YourReferee)?;
//!     outcome.replay.save("replay.json")?;
//!     for standing in &outcome.standings {
//!         println!("{}: {}", standing.agent_id, standing.score);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Agent Requirements
//!
//! - Every turn, the agent reads its input lines on stdin and must answer with the expected
//!   number of lines on stdout before the timeout
//! - The first turn may take up to the first-turn timeout
//! - Anything written on stderr is kept in the replay

pub mod agent;
mod cgroup_manager;
pub mod command;
pub mod configuration;
pub mod constraints;
pub mod error;
pub mod game_interface;
mod logger;
pub mod match_config;
pub mod match_runner;
pub mod recorder;

pub use anyhow;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use agent_arena::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{AgentError, AgentId, AgentSpec, FailureKind, TurnHandler};
    pub use crate::command::CommandBuffer;
    pub use crate::configuration::Configuration;
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::error::MatchError;
    pub use crate::game_interface::{Action, PlayerInfo, Referee, Standing, TurnRequest};
    pub use crate::match_config::{GameMode, GameParameters};
    pub use crate::match_runner::{MatchOutcome, MatchRunner, MatchState};
    pub use crate::recorder::Replay;
}
