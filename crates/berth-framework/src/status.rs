//! Plugin call outcomes.

use std::fmt;

/// Discriminant of a plugin call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Proceed.
    Success,
    /// Internal failure; the cycle aborts and the task retries after backoff.
    Error,
    /// The node will not fit now; retry on a relevant cluster event.
    Unschedulable,
    /// The node cannot fit without external change; do not retry until
    /// something structural changes.
    UnschedulableAndUnresolvable,
    /// Permit asked to wait; released by an external allow/reject.
    Wait,
    /// No contribution. Only meaningful at Score and Bind.
    Skip,
}

impl Code {
    /// Both unschedulable flavors.
    pub fn is_unschedulable(self) -> bool {
        matches!(self, Code::Unschedulable | Code::UnschedulableAndUnresolvable)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Success => "Success",
            Code::Error => "Error",
            Code::Unschedulable => "Unschedulable",
            Code::UnschedulableAndUnresolvable => "UnschedulableAndUnresolvable",
            Code::Wait => "Wait",
            Code::Skip => "Skip",
        };
        f.write_str(name)
    }
}

/// Outcome of a single extension-point call: a code, human-readable
/// reasons, and the plugin that produced a non-success outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    code: Code,
    reasons: Vec<String>,
    plugin: Option<String>,
}

impl Status {
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reasons: vec![reason.into()],
            plugin: None,
        }
    }

    pub fn success() -> Self {
        Self {
            code: Code::Success,
            reasons: Vec::new(),
            plugin: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            code: Code::Skip,
            reasons: Vec::new(),
            plugin: None,
        }
    }

    pub fn wait(reason: impl Into<String>) -> Self {
        Self::new(Code::Wait, reason)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Code::Error, reason)
    }

    pub fn unschedulable(reason: impl Into<String>) -> Self {
        Self::new(Code::Unschedulable, reason)
    }

    pub fn unschedulable_and_unresolvable(reason: impl Into<String>) -> Self {
        Self::new(Code::UnschedulableAndUnresolvable, reason)
    }

    /// Tag the failing plugin.
    pub fn with_plugin(mut self, name: &str) -> Self {
        self.plugin = Some(name.to_string());
        self
    }

    pub fn set_plugin(&mut self, name: &str) {
        self.plugin = Some(name.to_string());
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    pub fn is_skip(&self) -> bool {
        self.code == Code::Skip
    }

    pub fn is_wait(&self) -> bool {
        self.code == Code::Wait
    }

    pub fn is_unschedulable(&self) -> bool {
        self.code.is_unschedulable()
    }

    pub fn plugin(&self) -> Option<&str> {
        self.plugin.as_deref()
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn append_reason(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    /// Reasons joined for display.
    pub fn message(&self) -> String {
        self.reasons.join(", ")
    }

    /// Merge another non-success status into this one: reasons are
    /// concatenated and the more final code wins
    /// (UnschedulableAndUnresolvable > Unschedulable > anything else kept).
    pub fn merge(&mut self, other: Status) {
        if other.code == Code::UnschedulableAndUnresolvable
            || (self.code != Code::UnschedulableAndUnresolvable && other.code == Code::Error)
        {
            self.code = other.code;
        }
        self.reasons.extend(other.reasons);
        if self.plugin.is_none() {
            self.plugin = other.plugin;
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message())
        }
    }
}
