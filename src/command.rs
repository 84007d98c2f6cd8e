//! Line-based command buffers, the unit exchanged with agents and the referee.

use std::fmt::Display;

use thiserror::Error;

/// A line contained a line terminator and cannot be sent as one protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed line {line:?}: lines cannot contain '\\n' or '\\r'")]
pub struct MalformedLineError {
    /// The rejected text.
    pub line: String,
}

/// Ordered sequence of text lines forming one protocol exchange.
///
/// Lines are appended in order and never removed. Serialization terminates every line with
/// `'\n'`; [`CommandBuffer::parse`] gives back the same sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CommandBuffer {
    lines: Vec<String>,
}

impl CommandBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one line.
    ///
    /// # Errors
    /// Returns [`MalformedLineError`] if `text` contains `'\n'` or `'\r'`.
    pub fn add_line(&mut self, text: impl Into<String>) -> Result<&mut Self, MalformedLineError> {
        let line = text.into();
        if line.contains(['\n', '\r']) {
            return Err(MalformedLineError { line });
        }
        self.lines.push(line);
        Ok(self)
    }

    /// Builds a buffer from several lines, stopping at the first malformed one.
    pub fn from_lines<I, S>(lines: I) -> Result<Self, MalformedLineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut buffer = Self::new();
        for line in lines {
            buffer.add_line(line)?;
        }
        Ok(buffer)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Wire form, as written on an agent's stdin: every line newline-terminated.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Parses the form produced by [`CommandBuffer::serialize`].
    ///
    /// The empty string is the empty buffer and the final terminator may be omitted. A `'\r'`
    /// anywhere is rejected since no line may contain one.
    pub fn parse(wire: &str) -> Result<Self, MalformedLineError> {
        if wire.is_empty() {
            return Ok(Self::new());
        }
        let body = wire.strip_suffix('\n').unwrap_or(wire);
        Self::from_lines(body.split('\n'))
    }
}

impl Display for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lines.join(" | "))
    }
}

impl IntoIterator for CommandBuffer {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.into_iter()
    }
}
