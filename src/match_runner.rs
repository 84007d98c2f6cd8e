//! The match runner: drives one match from registration to replay.
//!
//! A [`MatchRunner`] goes through the following states:
//!
//! - [`MatchState::Configuring`]: agents, handlers, seed and parameters may be registered.
//! - [`MatchState::Starting`]: the initialization buffer is built, every agent is started and
//!   the referee is initialized. Any failure here aborts the match.
//! - [`MatchState::Running`]: the referee is asked for the next action until it reports the
//!   end of the match. Each step becomes one replay frame, in step order.
//! - [`MatchState::Ending`]: agents are stopped and the replay is finalized.
//! - [`MatchState::Ended`] or [`MatchState::Failed`]: terminal.
//!
//! Agents are stopped on every exit path. When a match fails, its frames are discarded and
//! no replay is produced.

use std::fmt::Display;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    agent::{Agent, AgentError, AgentId, AgentSpec, HandlerRegistry, StartContext, TurnHandler},
    configuration::Configuration,
    constraints::Constraints,
    error::MatchError,
    game_interface::{Action, PlayerInfo, Referee, Standing, TurnRequest, TurnResult},
    logger::init_logger,
    match_config::{GameMode, GameParameters, MatchConfig},
    recorder::{Frame, Replay, ReplayHeader, ReplayRecorder, TurnRecord},
};

/// Lifecycle state of a [`MatchRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Configuring,
    Starting,
    Running,
    Ending,
    Ended,
    Failed,
}

impl Display for MatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Result of a completed match.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub replay: Replay,
    pub standings: Vec<Standing>,
}

/// Runs a single match between registered agents under a [`Referee`].
pub struct MatchRunner {
    config: Configuration,
    constraints: Constraints,
    match_config: MatchConfig,
    handlers: HandlerRegistry,
    roster: Vec<Agent>,
    recorder: ReplayRecorder,
    state: MatchState,
}

impl MatchRunner {
    /// Create a runner in multi-player mode.
    #[instrument(skip_all)]
    pub fn new(config: Configuration, constraints: Constraints) -> MatchRunner {
        if config.log {
            if let Err(e) = init_logger() {
                warn!("could not install file logger: {e:#}");
            }
        }

        trace!(?config, ?constraints);

        MatchRunner {
            config,
            constraints,
            match_config: MatchConfig::default(),
            handlers: HandlerRegistry::new(),
            roster: vec![],
            recorder: ReplayRecorder::new(),
            state: MatchState::Configuring,
        }
    }

    /// Solo games need exactly one agent. Defaults to [`GameMode::Multi`].
    pub fn set_mode(&mut self, mode: GameMode) -> Result<(), MatchError> {
        self.ensure_configuring("set_mode")?;
        self.match_config.mode = mode;
        Ok(())
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    /// Registered agents, in id order.
    pub fn roster(&self) -> &[Agent] {
        &self.roster
    }

    pub fn match_config(&self) -> &MatchConfig {
        &self.match_config
    }

    /// Makes an in-process handler available to [`AgentSpec::Handler`] agents.
    pub fn register_handler<F, H>(&mut self, name: impl Into<String>, factory: F) -> Result<(), MatchError>
    where
        F: Fn() -> anyhow::Result<H> + Send + Sync + 'static,
        H: TurnHandler + 'static,
    {
        self.ensure_configuring("register_handler")?;
        self.handlers.register(name, factory);
        Ok(())
    }

    /// Adds an agent to the roster and returns its id: 0 for the first one, then 1, 2...
    pub fn register_agent(
        &mut self,
        spec: AgentSpec,
        nickname: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<AgentId, MatchError> {
        self.ensure_configuring("register_agent")?;
        let id = self.roster.len();
        debug!(id, %spec, "agent registered");
        self.roster.push(Agent::new(
            id,
            spec,
            nickname.map(str::to_string),
            avatar.map(str::to_string),
        ));
        Ok(id)
    }

    /// The seed is sent to the referee as the first initialization line, `seed=<value>`.
    pub fn set_seed(&mut self, seed: i64) -> Result<(), MatchError> {
        self.ensure_configuring("set_seed")?;
        self.match_config.seed = Some(seed);
        Ok(())
    }

    /// Parameters are sent to the referee as `key=value` lines, after the seed.
    pub fn set_parameters(&mut self, parameters: GameParameters) -> Result<(), MatchError> {
        self.ensure_configuring("set_parameters")?;
        self.match_config.parameters = parameters;
        Ok(())
    }

    /// Plays the whole match.
    ///
    /// # Errors
    /// [`MatchError::InvalidState`] if called twice or with an unusable roster,
    /// [`MatchError::AgentStart`] if an agent cannot start and [`MatchError::Referee`] if the
    /// referee fails. In every error case the match ends in [`MatchState::Failed`] (except a
    /// second call, which leaves the state alone) and no replay is produced.
    #[instrument(skip_all)]
    pub fn start(&mut self, referee: &mut dyn Referee) -> Result<MatchOutcome, MatchError> {
        self.ensure_configuring("start")?;
        self.state = MatchState::Starting;
        info!(
            agents = self.roster.len(),
            seed = ?self.match_config.seed,
            mode = %self.match_config.mode,
            "match starting"
        );

        let result = self.run(referee);
        self.stop_all();

        match result {
            Ok(outcome) => {
                self.state = MatchState::Ended;
                info!(frames = outcome.replay.frames().len(), "match ended");
                Ok(outcome)
            }
            Err(e) => {
                self.recorder.discard();
                self.state = MatchState::Failed;
                error!("match failed: {e}");
                if self.config.verbose {
                    println!("\x1b[2K\x1b[31mMatch failed: {e}\x1b[39m");
                }
                Err(e)
            }
        }
    }

    fn run(&mut self, referee: &mut dyn Referee) -> Result<MatchOutcome, MatchError> {
        self.validate_roster()?;
        let init = self.match_config.init_command()?;
        self.start_agents()?;

        let roster = self.player_infos();
        let seed = referee
            .initialize(&init, &roster, self.match_config.mode)
            .map_err(MatchError::Referee)?;
        debug!(seed, "referee initialized");

        self.state = MatchState::Running;
        let standings = loop {
            let step = self.recorder.len();
            let turns = match referee.next_action().map_err(MatchError::Referee)? {
                Action::Done(standings) => break standings,
                Action::Advance => vec![],
                Action::AgentTurns(requests) => self.play_turns(step, requests, referee)?,
            };
            let view = referee.end_step().map_err(MatchError::Referee)?;
            if self.config.verbose {
                print_step(step, &turns);
            }
            self.recorder.append(Frame { step, view, turns });
        };

        self.state = MatchState::Ending;
        self.stop_all();
        let replay = self.recorder.finalize(ReplayHeader {
            seed,
            mode: self.match_config.mode,
            parameters: self.match_config.parameters.clone(),
            agents: roster,
            standings: standings.clone(),
        })?;
        if self.config.verbose {
            print_standings(&self.roster, &standings);
        }
        Ok(MatchOutcome { replay, standings })
    }

    fn validate_roster(&self) -> Result<(), MatchError> {
        if self.roster.is_empty() {
            return Err(MatchError::InvalidState("no agent registered".to_string()));
        }
        if self.match_config.mode == GameMode::Solo && self.roster.len() != 1 {
            return Err(MatchError::InvalidState(format!(
                "a solo game needs exactly one agent, {} registered",
                self.roster.len()
            )));
        }
        Ok(())
    }

    fn start_agents(&mut self) -> Result<(), MatchError> {
        let ctx = StartContext {
            constraints: &self.constraints,
            config: &self.config,
            handlers: &self.handlers,
        };
        for agent in self.roster.iter_mut() {
            agent.start(ctx).map_err(MatchError::AgentStart)?;
        }
        Ok(())
    }

    /// Plays one step's turns and reports every result to the referee, in roster order.
    #[instrument(skip(self, requests, referee))]
    fn play_turns(
        &mut self,
        step: usize,
        mut requests: Vec<TurnRequest>,
        referee: &mut dyn Referee,
    ) -> Result<Vec<TurnRecord>, MatchError> {
        requests.sort_by_key(|r| r.agent_id);
        self.check_requests(&requests)?;

        let results = match requests.as_slice() {
            [request] => {
                let agent = &mut self.roster[request.agent_id];
                let timeout = self.constraints.turn_timeout(agent.turns());
                vec![agent.send_and_receive(&request.input, request.expected_lines, timeout)]
            }
            _ => self.exchange_all(&requests),
        };

        let mut records = Vec::with_capacity(requests.len());
        for (request, result) in requests.into_iter().zip(results) {
            let stderr = self.roster[request.agent_id].take_stderr();
            match &result {
                Ok(reply) => trace!(agent_id = request.agent_id, %reply, "turn played"),
                Err(e) => debug!(agent_id = request.agent_id, "turn failed: {e}"),
            }
            records.push(TurnRecord::new(
                request.agent_id,
                request.input,
                &result,
                stderr,
            ));
            referee
                .report_turn_result(request.agent_id, result)
                .map_err(MatchError::Referee)?;
        }
        Ok(records)
    }

    /// Writes every input first, then collects every reply in the same order, so the agents
    /// compute their replies at the same time.
    fn exchange_all(&mut self, requests: &[TurnRequest]) -> Vec<TurnResult> {
        let sent: Vec<Result<(), AgentError>> = requests
            .iter()
            .map(|r| {
                let agent = &mut self.roster[r.agent_id];
                let timeout = self.constraints.turn_timeout(agent.turns());
                agent.begin_turn(&r.input, r.expected_lines, timeout)
            })
            .collect();

        requests
            .iter()
            .zip(sent)
            .map(|(r, sent)| {
                let agent = &mut self.roster[r.agent_id];
                sent.and_then(|()| agent.finish_turn())
            })
            .collect()
    }

    /// Requests must be sorted by agent id.
    fn check_requests(&self, requests: &[TurnRequest]) -> Result<(), MatchError> {
        if let Some(r) = requests.iter().find(|r| r.agent_id >= self.roster.len()) {
            return Err(MatchError::Referee(anyhow::anyhow!(
                "turn requested for unknown agent {}",
                r.agent_id
            )));
        }
        if let Some(pair) = requests.windows(2).find(|p| p[0].agent_id == p[1].agent_id) {
            return Err(MatchError::Referee(anyhow::anyhow!(
                "agent {} requested twice in the same step",
                pair[0].agent_id
            )));
        }
        if let Some(r) = requests.iter().find(|r| r.expected_lines == 0) {
            return Err(MatchError::Referee(anyhow::anyhow!(
                "turn of agent {} expects no reply line",
                r.agent_id
            )));
        }
        Ok(())
    }

    fn player_infos(&self) -> Vec<PlayerInfo> {
        self.roster
            .iter()
            .map(|a| PlayerInfo {
                id: a.id(),
                nickname: a.nickname().map(str::to_string),
                avatar: a.avatar().map(str::to_string),
            })
            .collect()
    }

    fn stop_all(&mut self) {
        for agent in self.roster.iter_mut() {
            agent.stop();
        }
    }

    fn ensure_configuring(&self, operation: &str) -> Result<(), MatchError> {
        if self.state == MatchState::Configuring {
            Ok(())
        } else {
            Err(MatchError::InvalidState(format!(
                "'{operation}' is only allowed while configuring (match is {})",
                self.state
            )))
        }
    }
}

impl Drop for MatchRunner {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn print_step(step: usize, turns: &[TurnRecord]) {
    let turns = turns
        .iter()
        .map(|t| match t.failure {
            None => format!("{}: ok", t.agent_id),
            Some(kind) => format!("{}: \x1b[31m{kind:?}\x1b[39m", t.agent_id),
        })
        .collect::<Vec<_>>()
        .join(", ");
    // clear line, green step, turns, start of line
    print!("\x1b[2K\x1b[32mStep {step}:\x1b[39m {turns}\x1b[0G");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_standings(roster: &[Agent], standings: &[Standing]) {
    let scores = standings
        .iter()
        .map(|s| {
            let name = roster
                .get(s.agent_id)
                .map(Agent::name)
                .unwrap_or_else(|| format!("#{}", s.agent_id));
            format!("{name} {}", s.score)
        })
        .collect::<Vec<_>>()
        .join(" - ");
    println!("\x1b[2K\x1b[32mFinal:\x1b[39m {scores}");
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{command::CommandBuffer, game_interface::StepView};

    /// Plays `steps` steps, asking every agent for one line each time.
    struct Relay {
        steps: usize,
        init: Vec<String>,
        results: Vec<(AgentId, bool)>,
        players: usize,
    }

    impl Relay {
        fn new(steps: usize) -> Self {
            Relay {
                steps,
                init: vec![],
                results: vec![],
                players: 0,
            }
        }
    }

    impl Referee for Relay {
        fn initialize(
            &mut self,
            init: &CommandBuffer,
            roster: &[PlayerInfo],
            _mode: GameMode,
        ) -> anyhow::Result<i64> {
            self.init = init.lines().to_vec();
            self.players = roster.len();
            Ok(7)
        }

        fn next_action(&mut self) -> anyhow::Result<Action> {
            if self.steps == 0 {
                return Ok(Action::Done(
                    (0..self.players)
                        .map(|agent_id| Standing { agent_id, score: 1 })
                        .collect(),
                ));
            }
            self.steps -= 1;
            // reversed on purpose: the runner dispatches in roster order
            Ok(Action::AgentTurns(
                (0..self.players)
                    .rev()
                    .map(|id| TurnRequest::new(id, CommandBuffer::from_lines(["1"]).unwrap()))
                    .collect(),
            ))
        }

        fn report_turn_result(&mut self, agent_id: AgentId, result: TurnResult) -> anyhow::Result<()> {
            self.results.push((agent_id, result.is_ok()));
            Ok(())
        }

        fn end_step(&mut self) -> anyhow::Result<StepView> {
            Ok(StepView::default())
        }
    }

    struct Echo;

    impl TurnHandler for Echo {
        fn on_turn(&mut self, input: &CommandBuffer) -> anyhow::Result<CommandBuffer> {
            Ok(input.clone())
        }
    }

    fn runner() -> MatchRunner {
        let mut runner = MatchRunner::new(Configuration::new(), Constraints::default());
        runner.register_handler("echo", || Ok(Echo)).unwrap();
        runner
    }

    proptest! {
        #[test]
        fn ids_are_dense_and_ordered(count in 0usize..64, nicknamed in any::<bool>()) {
            let mut runner = runner();
            let ids: Vec<_> = (0..count)
                .map(|i| {
                    let nickname = nicknamed.then(|| format!("bot {i}"));
                    runner
                        .register_agent(AgentSpec::handler("echo"), nickname.as_deref(), None)
                        .unwrap()
                })
                .collect();
            prop_assert_eq!(ids, (0..count).collect::<Vec<_>>());
            prop_assert!(runner.roster().iter().enumerate().all(|(i, a)| a.id() == i));
        }
    }

    #[test]
    fn results_are_reported_in_roster_order() {
        let mut runner = runner();
        runner.register_agent(AgentSpec::handler("echo"), Some("a"), None).unwrap();
        runner.register_agent(AgentSpec::handler("echo"), Some("b"), None).unwrap();
        runner.set_seed(3).unwrap();

        let mut referee = Relay::new(2);
        let outcome = runner.start(&mut referee).unwrap();

        assert_eq!(referee.init, ["seed=3"]);
        assert_eq!(
            referee.results,
            [(0, true), (1, true), (0, true), (1, true)]
        );
        assert_eq!(outcome.replay.frames().len(), 2);
        assert_eq!(outcome.replay.seed(), 7);
        assert_eq!(runner.state(), MatchState::Ended);
    }

    #[test]
    fn configuration_is_frozen_after_start() {
        let mut runner = runner();
        runner.register_agent(AgentSpec::handler("echo"), None, None).unwrap();
        runner.start(&mut Relay::new(1)).unwrap();

        assert!(matches!(
            runner.register_agent(AgentSpec::handler("echo"), None, None),
            Err(MatchError::InvalidState(_))
        ));
        assert!(matches!(runner.set_seed(1), Err(MatchError::InvalidState(_))));
        assert!(matches!(
            runner.set_mode(GameMode::Solo),
            Err(MatchError::InvalidState(_))
        ));
        assert_eq!(runner.match_config().mode, GameMode::Multi);
        assert!(matches!(
            runner.set_parameters(GameParameters::new()),
            Err(MatchError::InvalidState(_))
        ));
        assert!(matches!(
            runner.start(&mut Relay::new(1)),
            Err(MatchError::InvalidState(_))
        ));
        assert_eq!(runner.state(), MatchState::Ended);
    }

    #[test]
    fn empty_roster_fails() {
        let mut runner = runner();
        assert!(matches!(
            runner.start(&mut Relay::new(1)),
            Err(MatchError::InvalidState(_))
        ));
        assert_eq!(runner.state(), MatchState::Failed);
    }

    #[test]
    fn solo_mode_needs_one_agent() {
        let mut runner = runner();
        runner.set_mode(GameMode::Solo).unwrap();
        runner.register_agent(AgentSpec::handler("echo"), None, None).unwrap();
        runner.register_agent(AgentSpec::handler("echo"), None, None).unwrap();
        assert!(runner.start(&mut Relay::new(1)).is_err());
        assert_eq!(runner.state(), MatchState::Failed);
    }

    #[test]
    fn unknown_handler_aborts_start() {
        let mut runner = runner();
        runner.register_agent(AgentSpec::handler("echo"), None, None).unwrap();
        runner.register_agent(AgentSpec::handler("nobody"), None, None).unwrap();
        let result = runner.start(&mut Relay::new(1));
        assert!(matches!(
            result,
            Err(MatchError::AgentStart(AgentError::Start { agent_id: 1, .. }))
        ));
        assert_eq!(runner.state(), MatchState::Failed);
        assert_eq!(runner.roster()[0].release_count(), 1);
        assert!(!runner.roster()[0].is_running());
        assert_eq!(runner.roster()[1].release_count(), 0);
    }
}
