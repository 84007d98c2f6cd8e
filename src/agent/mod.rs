//! Agents: the players of a match.
//!
//! An [`Agent`] is either an external executable spoken to over its stdin/stdout, or an
//! in-process [`TurnHandler`] looked up by name in a [`HandlerRegistry`]. Both expose the
//! same lifecycle: [`Agent::start`], any number of turns, then [`Agent::stop`].
//!
//! A turn writes one [`CommandBuffer`] to the agent and waits for exactly `expected_lines`
//! reply lines, bounded by a timeout. Any failure tears the agent down at once; the agent
//! then stays deactivated and every later turn fails with the same error.

use std::{
    fmt::Display,
    mem,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{command::CommandBuffer, configuration::Configuration, constraints::Constraints};

mod in_process;
mod process_agent;

pub use in_process::{HandlerRegistry, TurnHandler};

use in_process::InProcessAgent;
use process_agent::{ProcessAgent, ReceiveError, MAX_LINE_BYTES};

/// Dense, zero-based id assigned at registration.
pub type AgentId = usize;

/// How an agent is executed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentSpec {
    /// An external executable and its arguments.
    Command { program: String, args: Vec<String> },
    /// An in-process handler registered under this name.
    Handler(String),
}

impl AgentSpec {
    /// Splits `line` on whitespace: the first word is the program, the rest its arguments.
    /// Quoting is not interpreted.
    pub fn command_line(line: &str) -> Self {
        let mut words = line.split_whitespace().map(str::to_string);
        AgentSpec::Command {
            program: words.next().unwrap_or_default(),
            args: words.collect(),
        }
    }

    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AgentSpec::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn handler(name: impl Into<String>) -> Self {
        AgentSpec::Handler(name.into())
    }
}

impl Display for AgentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentSpec::Command { program, args } if args.is_empty() => write!(f, "{program}"),
            AgentSpec::Command { program, args } => write!(f, "{program} {}", args.join(" ")),
            AgentSpec::Handler(name) => write!(f, "handler:{name}"),
        }
    }
}

/// Why a turn (or a start) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    Start,
    Timeout,
    Crash,
    Protocol,
}

/// Agent-level failures. They never abort a running match by themselves: the referee
/// receives them as turn results.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent {agent_id} could not start: {message}")]
    Start { agent_id: AgentId, message: String },
    #[error("agent {agent_id} timed out after {timeout:?}")]
    Timeout { agent_id: AgentId, timeout: Duration },
    #[error("agent {agent_id} crashed: {message}")]
    Crash { agent_id: AgentId, message: String },
    #[error("agent {agent_id} broke the protocol: {message}")]
    Protocol { agent_id: AgentId, message: String },
}

impl AgentError {
    pub fn agent_id(&self) -> AgentId {
        match self {
            AgentError::Start { agent_id, .. }
            | AgentError::Timeout { agent_id, .. }
            | AgentError::Crash { agent_id, .. }
            | AgentError::Protocol { agent_id, .. } => *agent_id,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::Start { .. } => FailureKind::Start,
            AgentError::Timeout { .. } => FailureKind::Timeout,
            AgentError::Crash { .. } => FailureKind::Crash,
            AgentError::Protocol { .. } => FailureKind::Protocol,
        }
    }
}

/// What an agent needs from the runner to start.
#[derive(Clone, Copy)]
pub(crate) struct StartContext<'a> {
    pub constraints: &'a Constraints,
    pub config: &'a Configuration,
    pub handlers: &'a HandlerRegistry,
}

enum Backend {
    Process(ProcessAgent),
    InProcess(InProcessAgent),
}

enum AgentState {
    Registered,
    Running(Backend),
    Deactivated(AgentError),
    Stopped,
}

/// A registered player.
pub struct Agent {
    id: AgentId,
    nickname: Option<String>,
    avatar: Option<String>,
    spec: AgentSpec,
    state: AgentState,
    turns: usize,
    pending: Option<PendingTurn>,
    stderr: Vec<String>,
    releases: usize,
}

/// The turn in flight between `begin_turn` and `finish_turn`.
#[derive(Debug, Clone, Copy)]
struct PendingTurn {
    expected_lines: usize,
    timeout: Duration,
    deadline: Instant,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("nickname", &self.nickname)
            .field("spec", &self.spec.to_string())
            .field("turns", &self.turns)
            .finish()
    }
}

impl Agent {
    pub(crate) fn new(
        id: AgentId,
        spec: AgentSpec,
        nickname: Option<String>,
        avatar: Option<String>,
    ) -> Agent {
        Agent {
            id,
            nickname,
            avatar,
            spec,
            state: AgentState::Registered,
            turns: 0,
            pending: None,
            stderr: vec![],
            releases: 0,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn avatar(&self) -> Option<&str> {
        self.avatar.as_deref()
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    /// Display name: the nickname, or a name derived from the id.
    pub fn name(&self) -> String {
        self.nickname
            .clone()
            .unwrap_or_else(|| format!("Player {}", self.id))
    }

    /// Number of turns started so far.
    pub fn turns(&self) -> usize {
        self.turns
    }

    /// Failure that deactivated the agent, if any.
    pub fn failure(&self) -> Option<&AgentError> {
        match &self.state {
            AgentState::Deactivated(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, AgentState::Running(_))
    }

    /// How many times the agent's process or handler was released: 1 for a started agent
    /// once it is stopped (or torn down after a failure), 0 otherwise.
    pub fn release_count(&self) -> usize {
        self.releases
    }

    /// Launches the process or instantiates the handler.
    #[instrument(skip_all, fields(agent_id = self.id))]
    pub(crate) fn start(&mut self, ctx: StartContext<'_>) -> Result<(), AgentError> {
        if !matches!(self.state, AgentState::Registered) {
            return Err(AgentError::Start {
                agent_id: self.id,
                message: "agent was already started".to_string(),
            });
        }
        let backend = match &self.spec {
            AgentSpec::Command { program, args } => {
                ProcessAgent::launch(self.id, program, args, ctx.constraints, ctx.config)
                    .map(Backend::Process)
            }
            AgentSpec::Handler(name) => InProcessAgent::launch(self.id, name, ctx.handlers)
                .map(Backend::InProcess),
        };
        match backend {
            Ok(backend) => {
                debug!(spec = %self.spec, "agent started");
                self.state = AgentState::Running(backend);
                Ok(())
            }
            Err(e) => {
                let error = AgentError::Start {
                    agent_id: self.id,
                    message: format!("{e:#}"),
                };
                warn!("{error}");
                self.state = AgentState::Deactivated(error.clone());
                Err(error)
            }
        }
    }

    /// Writes `input` to the agent; the reply is collected by [`Agent::finish_turn`].
    ///
    /// Several agents can have a turn in flight at the same time: each one computes its
    /// reply independently while the runner collects them one after the other.
    pub(crate) fn begin_turn(
        &mut self,
        input: &CommandBuffer,
        expected_lines: usize,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        let id = self.id;
        let backend = match &mut self.state {
            AgentState::Running(backend) => backend,
            AgentState::Deactivated(e) => return Err(e.clone()),
            AgentState::Registered | AgentState::Stopped => {
                return Err(AgentError::Crash {
                    agent_id: id,
                    message: "agent is not running".to_string(),
                })
            }
        };
        self.turns += 1;
        let sent = match backend {
            Backend::Process(p) => p.send(input).map_err(|e| AgentError::Crash {
                agent_id: id,
                message: format!("could not write to stdin: {e}"),
            }),
            Backend::InProcess(h) => h.send(input).map_err(|message| AgentError::Crash {
                agent_id: id,
                message,
            }),
        };
        match sent {
            Ok(()) => {
                self.pending = Some(PendingTurn {
                    expected_lines,
                    timeout,
                    deadline: Instant::now() + timeout,
                });
                Ok(())
            }
            Err(e) => Err(self.deactivate(e)),
        }
    }

    /// Waits for the reply of the turn started by [`Agent::begin_turn`].
    pub(crate) fn finish_turn(&mut self) -> Result<CommandBuffer, AgentError> {
        let id = self.id;
        if let AgentState::Deactivated(e) = &self.state {
            return Err(e.clone());
        }
        let Some(PendingTurn {
            expected_lines: expected,
            timeout,
            deadline,
        }) = self.pending.take()
        else {
            return Err(AgentError::Protocol {
                agent_id: id,
                message: "no turn in flight".to_string(),
            });
        };
        let reply = match &mut self.state {
            AgentState::Running(Backend::Process(p)) => {
                p.receive(expected, deadline).map_err(|e| match e {
                    ReceiveError::Timeout { received: 0 } => AgentError::Timeout {
                        agent_id: id,
                        timeout,
                    },
                    ReceiveError::Timeout { received } => AgentError::Protocol {
                        agent_id: id,
                        message: format!(
                            "only {received}/{expected} lines before the deadline"
                        ),
                    },
                    ReceiveError::Closed { received } => AgentError::Crash {
                        agent_id: id,
                        message: format!("output closed after {received}/{expected} lines"),
                    },
                    ReceiveError::NotText => AgentError::Protocol {
                        agent_id: id,
                        message: "reply is not valid UTF-8 text".to_string(),
                    },
                    ReceiveError::LineTooLong => AgentError::Protocol {
                        agent_id: id,
                        message: format!("reply line longer than {MAX_LINE_BYTES} bytes"),
                    },
                    ReceiveError::InputFailed(e) => AgentError::Crash {
                        agent_id: id,
                        message: format!("could not write to stdin: {e}"),
                    },
                })
            }
            AgentState::Running(Backend::InProcess(h)) => {
                h.receive(expected, deadline).map_err(|e| e.into_agent_error(id, timeout))
            }
            _ => Err(AgentError::Crash {
                agent_id: id,
                message: "agent is not running".to_string(),
            }),
        };
        match reply {
            Ok(lines) => CommandBuffer::from_lines(lines).map_err(|e| {
                let error = AgentError::Protocol {
                    agent_id: id,
                    message: e.to_string(),
                };
                self.deactivate(error)
            }),
            Err(e) => Err(self.deactivate(e)),
        }
    }

    /// One complete turn: write `input`, then wait up to `timeout` for `expected_lines`
    /// reply lines.
    pub fn send_and_receive(
        &mut self,
        input: &CommandBuffer,
        expected_lines: usize,
        timeout: Duration,
    ) -> Result<CommandBuffer, AgentError> {
        self.begin_turn(input, expected_lines, timeout)?;
        self.finish_turn()
    }

    /// Stderr lines written by the agent since the last call.
    pub(crate) fn take_stderr(&mut self) -> Vec<String> {
        if let AgentState::Running(Backend::Process(p)) = &self.state {
            self.stderr.extend(p.drain_stderr());
        }
        mem::take(&mut self.stderr)
    }

    /// Releases the process or handler. Safe to call any number of times.
    #[instrument(skip_all, fields(agent_id = self.id))]
    pub fn stop(&mut self) {
        match mem::replace(&mut self.state, AgentState::Stopped) {
            AgentState::Running(backend) => {
                self.release(backend);
                debug!("agent stopped");
            }
            // already torn down, keep the failure visible
            AgentState::Deactivated(e) => self.state = AgentState::Deactivated(e),
            AgentState::Registered => self.state = AgentState::Registered,
            AgentState::Stopped => {}
        }
    }

    fn release(&mut self, backend: Backend) {
        self.releases += 1;
        match backend {
            Backend::Process(mut p) => {
                self.stderr.extend(p.drain_stderr());
                p.kill();
            }
            Backend::InProcess(h) => h.stop(),
        }
    }

    fn deactivate(&mut self, error: AgentError) -> AgentError {
        warn!(agent_id = self.id, "{error}");
        self.pending = None;
        if let AgentState::Running(backend) = mem::replace(
            &mut self.state,
            AgentState::Deactivated(error.clone()),
        ) {
            self.release(backend);
        }
        error
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}
