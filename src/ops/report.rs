use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::{self, Write as _};

/// Outcome class of an operational command. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Usable, but the operator should act
    Degraded,
    Fatal,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Degraded => 1,
            Outcome::Fatal => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Degraded => "degraded",
            Outcome::Fatal => "fatal",
        }
    }
}

/// Result of one operational command, printable for humans or as JSON.
///
/// Details carry identifiers and timestamps only. Token values and key
/// bytes never go in a report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub operation: &'static str,
    pub outcome: Outcome,
    pub passed: bool,
    pub details: Map<String, Value>,
    pub messages: Vec<String>,
}

impl OperationReport {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            outcome: Outcome::Success,
            passed: true,
            details: Map::new(),
            messages: Vec::new(),
        }
    }

    pub fn detail(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn note(&mut self, message: impl Into<String>) -> &mut Self {
        self.messages.push(message.into());
        self
    }

    pub fn degrade(&mut self, message: impl Into<String>) -> &mut Self {
        self.escalate(Outcome::Degraded);
        self.note(message)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> &mut Self {
        self.escalate(Outcome::Fatal);
        self.note(message)
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn escalate(&mut self, outcome: Outcome) {
        self.outcome = self.outcome.max(outcome);
        self.passed = self.outcome != Outcome::Fatal;
    }
}

impl fmt::Display for OperationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        writeln!(out, "{}: {}", self.operation, self.outcome.as_str().to_uppercase())?;

        for (key, value) in &self.details {
            match value {
                Value::String(s) => writeln!(out, "  {key}: {s}")?,
                other => writeln!(out, "  {key}: {other}")?,
            }
        }
        for message in &self.messages {
            writeln!(out, "  - {message}")?;
        }

        f.write_str(out.trim_end())
    }
}
