use agent_arena::{
    game_interface::{StepView, TurnResult},
    prelude::*,
};
use anyhow::bail;

/// What an agent answered to one turn.
pub type Reply = Result<Vec<String>, FailureKind>;

/// Sends `ping <step>` to every agent, every step, for a fixed number of steps.
///
/// Scores one point per successful turn.
pub struct PingReferee {
    steps: usize,
    expected_lines: usize,
    padding: usize,
    fail_at_step: Option<usize>,
    step: usize,
    pub init: Vec<String>,
    pub mode: Option<GameMode>,
    pub players: Vec<PlayerInfo>,
    /// Replies of every step, in the order they were reported.
    pub replies: Vec<Vec<(AgentId, Reply)>>,
}

impl PingReferee {
    pub fn new(steps: usize) -> Self {
        PingReferee {
            steps,
            expected_lines: 1,
            padding: 0,
            fail_at_step: None,
            step: 0,
            init: vec![],
            mode: None,
            players: vec![],
            replies: vec![],
        }
    }

    pub fn expecting(mut self, lines: usize) -> Self {
        self.expected_lines = lines;
        self
    }

    /// Appends `lines` filler lines of 1000 characters to every input.
    pub fn with_padding(mut self, lines: usize) -> Self {
        self.padding = lines;
        self
    }

    /// `end_step` fails on this step.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Every reply of one agent, step by step.
    pub fn replies_of(&self, agent_id: AgentId) -> Vec<Reply> {
        self.replies
            .iter()
            .flatten()
            .filter(|(id, _)| *id == agent_id)
            .map(|(_, reply)| reply.clone())
            .collect()
    }
}

impl Referee for PingReferee {
    fn initialize(
        &mut self,
        init: &CommandBuffer,
        roster: &[PlayerInfo],
        mode: GameMode,
    ) -> anyhow::Result<i64> {
        self.init = init.lines().to_vec();
        self.players = roster.to_vec();
        self.mode = Some(mode);
        let seed = init
            .lines()
            .first()
            .and_then(|line| line.strip_prefix("seed="))
            .map(str::parse::<i64>)
            .transpose()?;
        Ok(seed.unwrap_or(0))
    }

    fn next_action(&mut self) -> anyhow::Result<Action> {
        if self.step == self.steps {
            let standings = self
                .players
                .iter()
                .map(|p| Standing {
                    agent_id: p.id,
                    score: self.replies_of(p.id).iter().filter(|r| r.is_ok()).count() as i64,
                })
                .collect();
            return Ok(Action::Done(standings));
        }
        self.replies.push(vec![]);
        let mut requests = vec![];
        // highest id first: the runner must reorder them
        for player in self.players.iter().rev() {
            let filler = std::iter::repeat("x".repeat(1000)).take(self.padding);
            let input = CommandBuffer::from_lines(
                std::iter::once(format!("ping {}", self.step)).chain(filler),
            )?;
            requests.push(TurnRequest::new(player.id, input).with_expected_lines(self.expected_lines));
        }
        Ok(Action::AgentTurns(requests))
    }

    fn report_turn_result(&mut self, agent_id: AgentId, result: TurnResult) -> anyhow::Result<()> {
        let reply = result
            .map(|buffer| buffer.lines().to_vec())
            .map_err(|e| e.kind());
        match self.replies.last_mut() {
            Some(step) => step.push((agent_id, reply)),
            None => bail!("turn result reported outside of a step"),
        }
        Ok(())
    }

    fn end_step(&mut self) -> anyhow::Result<StepView> {
        if self.fail_at_step == Some(self.step) {
            bail!("board exploded at step {}", self.step);
        }
        let view = StepView {
            view: format!("step {}", self.step),
            summary: format!("{} replies", self.replies.last().map_or(0, Vec::len)),
            tooltips: vec![],
            keyframe: self.step == 0,
        };
        self.step += 1;
        Ok(view)
    }
}
