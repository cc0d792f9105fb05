//! Pattern expectations used to drive the console conversation.

use std::fmt;

use regex::bytes::Regex;

use super::Error;

/// A status attached to a [`Outcome::Continue`] case. The code is free for the
/// caller to interpret; the message is used in logs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Status {
    pub code: u32,
    pub message: &'static str,
}
impl Status {
    pub const fn new(code: u32, message: &'static str) -> Self {
        Status { code, message }
    }
}
impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// What a matching case means for the caller.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    /// The wait is over, the expected output showed up.
    Success,
    /// A known, non-final condition. The caller decides whether to wait again.
    Continue(Status),
}

/// One branch of a multi-way wait.
#[derive(Debug, Clone)]
pub struct Case {
    pub pattern: Regex,
    pub outcome: Outcome,
}
impl Case {
    pub fn new(pattern: &str, outcome: Outcome) -> Result<Self, Error> {
        Ok(Case {
            pattern: Regex::new(pattern)?,
            outcome,
        })
    }

    pub fn success(pattern: &str) -> Result<Self, Error> {
        Self::new(pattern, Outcome::Success)
    }

    pub fn continue_with(pattern: &str, status: Status) -> Result<Self, Error> {
        Self::new(pattern, Outcome::Continue(status))
    }
}

/// The result of a satisfied wait.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Matched {
    /// Position of the satisfied case in the list that was waited on.
    pub case: usize,
    pub outcome: Outcome,
    /// The matched text, lossily decoded.
    pub text: String,
}

/// A step of a scripted [`batch`](super::Session::batch).
#[derive(Debug, Clone)]
pub enum Step {
    Expect(Regex),
    Send(String),
}
impl Step {
    pub fn expect(pattern: &str) -> Result<Self, Error> {
        Ok(Step::Expect(Regex::new(pattern)?))
    }

    pub fn send<S: Into<String>>(text: S) -> Self {
        Step::Send(text.into())
    }
}

/// Joins case patterns for error messages.
pub(crate) fn describe(cases: &[Case]) -> String {
    cases
        .iter()
        .map(|case| case.pattern.as_str())
        .collect::<Vec<_>>()
        .join(" | ")
}
