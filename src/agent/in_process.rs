use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use tracing::{debug, warn};

use crate::command::CommandBuffer;

use super::{AgentError, AgentId};

/// How long `stop` waits for a handler to acknowledge it.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Trusted agent code running inside the runner.
///
/// Each handler runs on its own thread, so a slow turn can still be timed out. A handler
/// returning an error or panicking counts as a crash.
pub trait TurnHandler: Send {
    /// Answers one turn. The reply must contain at least as many lines as the referee
    /// expects; extra lines are ignored.
    fn on_turn(&mut self, input: &CommandBuffer) -> anyhow::Result<CommandBuffer>;

    /// Called once when the agent is stopped.
    fn on_stop(&mut self) {}
}

type HandlerFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn TurnHandler>> + Send + Sync>;

/// Named constructors of in-process agents.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous one.
    pub fn register<F, H>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<H> + Send + Sync + 'static,
        H: TurnHandler + 'static,
    {
        self.factories.insert(
            name.into(),
            Box::new(move || Ok(Box::new(factory()?) as Box<dyn TurnHandler>)),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn create(&self, name: &str) -> anyhow::Result<Box<dyn TurnHandler>> {
        let factory = self
            .factories
            .get(name)
            .with_context(|| format!("no handler registered as '{name}'"))?;
        factory().with_context(|| format!("handler '{name}' could not be created"))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

#[derive(Debug)]
pub(super) enum InProcessError {
    Timeout,
    Failed(String),
    Truncated { received: usize, expected: usize },
}

impl InProcessError {
    pub fn into_agent_error(self, agent_id: AgentId, timeout: Duration) -> AgentError {
        match self {
            InProcessError::Timeout => AgentError::Timeout { agent_id, timeout },
            InProcessError::Failed(message) => AgentError::Crash { agent_id, message },
            InProcessError::Truncated { received, expected } => AgentError::Protocol {
                agent_id,
                message: format!("only {received}/{expected} lines in reply"),
            },
        }
    }
}

/// A [`TurnHandler`] driven on a dedicated worker thread.
pub(super) struct InProcessAgent {
    id: AgentId,
    requests: Sender<CommandBuffer>,
    replies: Receiver<Result<CommandBuffer, String>>,
    stopped: Receiver<()>,
    hung: bool,
}

impl InProcessAgent {
    pub fn launch(id: AgentId, name: &str, registry: &HandlerRegistry) -> anyhow::Result<Self> {
        let mut handler = registry.create(name)?;
        let (tx_request, rx_request) = mpsc::channel::<CommandBuffer>();
        let (tx_reply, rx_reply) = mpsc::channel();
        let (tx_stopped, rx_stopped) = mpsc::channel();

        thread::Builder::new()
            .name(format!("agent-{id}-{name}"))
            .spawn(move || {
                for input in rx_request {
                    let reply = panic::catch_unwind(AssertUnwindSafe(|| handler.on_turn(&input)))
                        .unwrap_or_else(|_| Err(anyhow!("handler panicked")))
                        .map_err(|e| format!("{e:#}"));
                    if tx_reply.send(reply).is_err() {
                        break;
                    }
                }
                handler.on_stop();
                let _ = tx_stopped.send(());
            })
            .context("could not spawn handler thread")?;

        Ok(InProcessAgent {
            id,
            requests: tx_request,
            replies: rx_reply,
            stopped: rx_stopped,
            hung: false,
        })
    }

    pub fn send(&mut self, input: &CommandBuffer) -> Result<(), String> {
        self.requests
            .send(input.clone())
            .map_err(|_| "handler thread is gone".to_string())
    }

    pub fn receive(&mut self, expected: usize, deadline: Instant) -> Result<Vec<String>, InProcessError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let reply = match self.replies.recv_timeout(remaining) {
            Ok(reply) => reply.map_err(InProcessError::Failed)?,
            Err(RecvTimeoutError::Timeout) => {
                self.hung = true;
                return Err(InProcessError::Timeout);
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(InProcessError::Failed("handler thread is gone".to_string()))
            }
        };
        if reply.len() < expected {
            return Err(InProcessError::Truncated {
                received: reply.len(),
                expected,
            });
        }
        if reply.len() > expected {
            debug!(agent_id = self.id, "ignoring {} extra lines", reply.len() - expected);
        }
        Ok(reply.into_iter().take(expected).collect())
    }

    /// Closes the request channel; the worker calls `on_stop` once its current turn ends.
    ///
    /// Waits for that acknowledgement unless the handler already missed a deadline.
    pub fn stop(self) {
        let InProcessAgent {
            id,
            requests,
            stopped,
            hung,
            ..
        } = self;
        drop(requests);
        if hung {
            return;
        }
        if stopped.recv_timeout(STOP_GRACE).is_err() {
            warn!(agent_id = id, "handler did not stop within {STOP_GRACE:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct Doubler {
        stops: Arc<AtomicUsize>,
    }

    impl TurnHandler for Doubler {
        fn on_turn(&mut self, input: &CommandBuffer) -> anyhow::Result<CommandBuffer> {
            let n: i64 = input.lines()[0].parse()?;
            Ok(CommandBuffer::from_lines([(2 * n).to_string()])?)
        }

        fn on_stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry(stops: Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("doubler", move || {
            Ok(Doubler {
                stops: stops.clone(),
            })
        });
        registry
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn answers_and_stops_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut agent = InProcessAgent::launch(0, "doubler", &registry(stops.clone())).unwrap();
        agent.send(&CommandBuffer::from_lines(["21"]).unwrap()).unwrap();
        assert_eq!(agent.receive(1, soon()).unwrap(), ["42"]);
        agent.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_error_is_a_failure() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut agent = InProcessAgent::launch(0, "doubler", &registry(stops)).unwrap();
        agent.send(&CommandBuffer::from_lines(["abc"]).unwrap()).unwrap();
        assert!(matches!(
            agent.receive(1, soon()),
            Err(InProcessError::Failed(_))
        ));
        agent.stop();
    }

    #[test]
    fn short_reply_is_truncated() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut agent = InProcessAgent::launch(0, "doubler", &registry(stops)).unwrap();
        agent.send(&CommandBuffer::from_lines(["1"]).unwrap()).unwrap();
        assert!(matches!(
            agent.receive(2, soon()),
            Err(InProcessError::Truncated {
                received: 1,
                expected: 2
            })
        ));
        agent.stop();
    }

    #[test]
    fn unknown_handler_cannot_launch() {
        let registry = HandlerRegistry::new();
        assert!(InProcessAgent::launch(0, "missing", &registry).is_err());
        assert!(!registry.contains("missing"));
    }
}
