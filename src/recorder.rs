//! Replay recording.
//!
//! The [`ReplayRecorder`] accumulates one [`Frame`] per simulation step while the match
//! runs. When the match ends it is finalized, exactly once, into an immutable [`Replay`]
//! that can be saved as JSON or rendered for the replay viewer page.

use std::{mem, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    agent::{AgentId, FailureKind},
    command::CommandBuffer,
    error::MatchError,
    game_interface::{PlayerInfo, Standing, StepView, TurnResult},
    match_config::{GameMode, GameParameters},
};

/// One agent turn as it happened during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub agent_id: AgentId,
    pub input: CommandBuffer,
    pub output: Option<CommandBuffer>,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    /// Lines the agent wrote on stderr during the turn.
    pub stderr: Vec<String>,
}

impl TurnRecord {
    pub(crate) fn new(
        agent_id: AgentId,
        input: CommandBuffer,
        result: &TurnResult,
        stderr: Vec<String>,
    ) -> Self {
        let (output, failure, message) = match result {
            Ok(output) => (Some(output.clone()), None, None),
            Err(e) => (None, Some(e.kind()), Some(e.to_string())),
        };
        TurnRecord {
            agent_id,
            input,
            output,
            failure,
            message,
            stderr,
        }
    }
}

/// One recorded simulation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub step: usize,
    #[serde(flatten)]
    pub view: StepView,
    pub turns: Vec<TurnRecord>,
}

/// Match facts stored alongside the frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayHeader {
    pub seed: i64,
    pub mode: GameMode,
    pub parameters: GameParameters,
    pub agents: Vec<PlayerInfo>,
    pub standings: Vec<Standing>,
}

/// The finalized record of a completed match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replay {
    seed: i64,
    mode: GameMode,
    parameters: GameParameters,
    agents: Vec<PlayerInfo>,
    frames: Vec<Frame>,
    standings: Vec<Standing>,
}

impl Replay {
    /// The seed the referee actually used.
    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    pub fn parameters(&self) -> &GameParameters {
        &self.parameters
    }

    pub fn agents(&self) -> &[PlayerInfo] {
        &self.agents
    }

    /// Frames in step order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn standings(&self) -> &[Standing] {
        &self.standings
    }

    /// Save the replay as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("could not serialize replay")?;
        std::fs::write(path, json)
            .with_context(|| format!("could not write replay to '{}'", path.display()))
    }

    /// Load a replay written by [`Replay::save`].
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("could not read replay '{}'", path.display()))?;
        serde_json::from_str(&json).context("could not deserialize replay")
    }

    /// The document consumed by the replay viewer page.
    ///
    /// Views are prefixed with their frame header (`KEY_FRAME` or `INTERMEDIATE_FRAME`).
    /// `outputs` and `errors` hold, per agent id, that agent's stdout and stderr for every
    /// frame (`null` when it did not play).
    pub fn to_viewer_json(&self) -> Value {
        let ids: Vec<String> = self.agents.iter().map(|a| a.id.to_string()).collect();
        let agents: Vec<Value> = self
            .agents
            .iter()
            .map(|a| {
                json!({
                    "index": a.id,
                    "name": a.nickname.clone().unwrap_or_else(|| format!("Player {}", a.id)),
                    "avatar": a.avatar,
                })
            })
            .collect();

        let views: Vec<String> = self
            .frames
            .iter()
            .map(|f| {
                let header = if f.view.keyframe {
                    "KEY_FRAME"
                } else {
                    "INTERMEDIATE_FRAME"
                };
                format!("{header}\n{}", f.view.view)
            })
            .collect();
        let summaries: Vec<&str> = self.frames.iter().map(|f| f.view.summary.as_str()).collect();

        let mut outputs = serde_json::Map::new();
        let mut errors = serde_json::Map::new();
        outputs.insert(
            "referee".to_string(),
            Value::Array(vec![Value::Null; self.frames.len()]),
        );
        for agent in &self.agents {
            let turn_of = |f: &Frame| f.turns.iter().find(|t| t.agent_id == agent.id).cloned();
            let stdout: Vec<Value> = self
                .frames
                .iter()
                .map(|f| match turn_of(f) {
                    Some(TurnRecord {
                        output: Some(out), ..
                    }) => Value::String(out.serialize()),
                    _ => Value::Null,
                })
                .collect();
            let stderr: Vec<Value> = self
                .frames
                .iter()
                .map(|f| match turn_of(f) {
                    Some(t) if !t.stderr.is_empty() || t.message.is_some() => {
                        let mut lines = t.stderr;
                        lines.extend(t.message);
                        Value::String(lines.join("\n"))
                    }
                    _ => Value::Null,
                })
                .collect();
            outputs.insert(agent.id.to_string(), Value::Array(stdout));
            errors.insert(agent.id.to_string(), Value::Array(stderr));
        }

        let tooltips: Vec<Value> = self
            .frames
            .iter()
            .flat_map(|f| {
                f.view
                    .tooltips
                    .iter()
                    .map(move |text| json!({ "turn": f.step, "text": text }))
            })
            .collect();

        json!({
            "agents": agents,
            "ids": ids,
            "views": views,
            "summaries": summaries,
            "outputs": outputs,
            "errors": errors,
            "tooltips": tooltips,
        })
    }
}

/// Append-only accumulator of frames.
#[derive(Debug, Default)]
pub struct ReplayRecorder {
    frames: Vec<Frame>,
    finalized: bool,
}

impl ReplayRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the next frame.
    pub fn append(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Number of frames recorded so far, which is also the index of the next step.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Produces the replay. A second call fails and leaves the first replay untouched.
    pub fn finalize(&mut self, header: ReplayHeader) -> Result<Replay, MatchError> {
        if self.finalized {
            return Err(MatchError::InvalidState(
                "replay was already finalized".to_string(),
            ));
        }
        self.finalized = true;
        let ReplayHeader {
            seed,
            mode,
            parameters,
            agents,
            standings,
        } = header;
        Ok(Replay {
            seed,
            mode,
            parameters,
            agents,
            frames: mem::take(&mut self.frames),
            standings,
        })
    }

    /// Drops every recorded frame; used when the match aborts.
    pub(crate) fn discard(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::AgentError;

    fn header() -> ReplayHeader {
        ReplayHeader {
            seed: 42,
            mode: GameMode::Multi,
            parameters: vec![("width", "10")].try_into().unwrap(),
            agents: vec![
                PlayerInfo {
                    id: 0,
                    nickname: Some("echo".to_string()),
                    avatar: None,
                },
                PlayerInfo {
                    id: 1,
                    nickname: None,
                    avatar: Some("https://example.org/b.png".to_string()),
                },
            ],
            standings: vec![Standing {
                agent_id: 0,
                score: 3,
            }],
        }
    }

    fn frame(step: usize, keyframe: bool) -> Frame {
        let ok: TurnResult = Ok(CommandBuffer::from_lines([format!("move {step}")]).unwrap());
        let timeout: TurnResult = Err(AgentError::Timeout {
            agent_id: 1,
            timeout: Duration::from_millis(50),
        });
        Frame {
            step,
            view: StepView {
                view: format!("view {step}"),
                summary: format!("step {step}"),
                tooltips: vec![],
                keyframe,
            },
            turns: vec![
                TurnRecord::new(0, CommandBuffer::from_lines(["go"]).unwrap(), &ok, vec![]),
                TurnRecord::new(
                    1,
                    CommandBuffer::from_lines(["go"]).unwrap(),
                    &timeout,
                    vec!["thinking".to_string()],
                ),
            ],
        }
    }

    #[test]
    fn frames_keep_append_order() {
        let mut recorder = ReplayRecorder::new();
        for step in 0..5 {
            recorder.append(frame(step, true));
        }
        let replay = recorder.finalize(header()).unwrap();
        let steps: Vec<_> = replay.frames().iter().map(|f| f.step).collect();
        assert_eq!(steps, [0, 1, 2, 3, 4]);
        assert_eq!(replay.seed(), 42);
    }

    #[test]
    fn second_finalize_is_refused() {
        let mut recorder = ReplayRecorder::new();
        recorder.append(frame(0, true));
        let replay = recorder.finalize(header()).unwrap();
        assert!(matches!(
            recorder.finalize(header()),
            Err(MatchError::InvalidState(_))
        ));
        assert_eq!(replay.frames().len(), 1);
        assert!(recorder.is_finalized());
    }

    #[test]
    fn failed_turns_are_recorded() {
        let record = &frame(0, true).turns[1];
        assert_eq!(record.output, None);
        assert_eq!(record.failure, Some(FailureKind::Timeout));
        assert!(record.message.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn viewer_document_layout() {
        let mut recorder = ReplayRecorder::new();
        recorder.append(frame(0, true));
        recorder.append(frame(1, false));
        let doc = recorder.finalize(header()).unwrap().to_viewer_json();

        assert_eq!(doc["ids"], json!(["0", "1"]));
        assert_eq!(doc["agents"][0]["name"], "echo");
        assert_eq!(doc["agents"][1]["name"], "Player 1");
        assert_eq!(doc["agents"][1]["avatar"], "https://example.org/b.png");
        assert_eq!(doc["views"][0], "KEY_FRAME\nview 0");
        assert_eq!(doc["views"][1], "INTERMEDIATE_FRAME\nview 1");
        assert_eq!(doc["summaries"][1], "step 1");
        assert_eq!(doc["outputs"]["0"][1], "move 1\n");
        assert_eq!(doc["outputs"]["1"][0], Value::Null);
        assert_eq!(doc["outputs"]["referee"].as_array().unwrap().len(), 2);
        let err = doc["errors"]["1"][0].as_str().unwrap();
        assert!(err.starts_with("thinking\n"));
        assert_eq!(doc["errors"]["0"][0], Value::Null);
    }

    #[test]
    fn save_and_load() {
        let mut recorder = ReplayRecorder::new();
        recorder.append(frame(0, true));
        let replay = recorder.finalize(header()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        replay.save(&path).unwrap();
        assert_eq!(Replay::load(&path).unwrap(), replay);
    }
}
