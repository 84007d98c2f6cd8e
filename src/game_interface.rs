//! Module defining what a referee must implement to be driven by the [`MatchRunner`]
//!
//! The referee owns the game rules. The runner only asks it what to do next, delivers
//! agent replies (or their failures) back to it, and records one frame per step.
//!
//! [`MatchRunner`]: crate::match_runner::MatchRunner

use serde::{Deserialize, Serialize};

use crate::{
    agent::{AgentError, AgentId},
    command::CommandBuffer,
    match_config::GameMode,
};

/// Public view of a roster entry, given to the referee on initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: AgentId,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
}

/// One agent turn requested by the referee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub agent_id: AgentId,
    /// Lines written to the agent.
    pub input: CommandBuffer,
    /// Number of lines the agent must reply with.
    pub expected_lines: usize,
}

impl TurnRequest {
    /// A request expecting a single reply line.
    pub fn new(agent_id: AgentId, input: CommandBuffer) -> Self {
        TurnRequest {
            agent_id,
            input,
            expected_lines: 1,
        }
    }

    pub fn with_expected_lines(mut self, expected_lines: usize) -> Self {
        self.expected_lines = expected_lines;
        self
    }
}

/// Final score of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub agent_id: AgentId,
    pub score: i64,
}

/// What the runner should do for the next simulation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Deliver these inputs and wait for every reply (or failure) before ending the step.
    AgentTurns(Vec<TurnRequest>),
    /// Advance the simulation without agent input.
    Advance,
    /// The match is over.
    Done(Vec<Standing>),
}

/// Outcome of one agent turn, handed back to the referee.
pub type TurnResult = Result<CommandBuffer, AgentError>;

/// What the referee wants recorded for a completed step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    /// View-layer commands, opaque to the runner.
    pub view: String,
    /// Human readable summary of the step.
    pub summary: String,
    pub tooltips: Vec<String>,
    /// Whether a viewer may start playback from this frame.
    pub keyframe: bool,
}

/// What the game logic must implement.
///
/// Any error returned by these methods aborts the match.
pub trait Referee {
    /// Receives the initialization buffer (`seed=...` first if any, then one `key=value` line
    /// per parameter), the roster and the game mode.
    ///
    /// Returns the seed actually used, so that a match without a configured seed can be
    /// replayed.
    fn initialize(
        &mut self,
        init: &CommandBuffer,
        roster: &[PlayerInfo],
        mode: GameMode,
    ) -> anyhow::Result<i64>;

    /// What to do next.
    fn next_action(&mut self) -> anyhow::Result<Action>;

    /// Result of one turn requested by the last [`Action::AgentTurns`].
    ///
    /// Deciding whether a failure eliminates the agent or ends the game is up to the referee.
    fn report_turn_result(&mut self, agent_id: AgentId, result: TurnResult) -> anyhow::Result<()>;

    /// Called once at the end of every step, after all its turn results were reported.
    fn end_step(&mut self) -> anyhow::Result<StepView>;
}
