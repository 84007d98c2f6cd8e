//! Match-level errors.

use thiserror::Error;

use crate::{agent::AgentError, command::MalformedLineError};

/// Errors that abort a match or reject a call.
///
/// Agent failures during a running match are not reported here: they are handed to the
/// referee as turn results. Only an agent that cannot start at all aborts the match.
#[derive(Debug, Error)]
pub enum MatchError {
    /// The call is not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A seed or parameter cannot be rendered as a protocol line.
    #[error(transparent)]
    MalformedLine(#[from] MalformedLineError),

    /// An agent could not be started.
    #[error("match aborted: {0}")]
    AgentStart(AgentError),

    /// The referee failed or broke its contract.
    #[error("referee error: {0:#}")]
    Referee(anyhow::Error),
}
