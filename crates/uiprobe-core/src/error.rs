//! Error types for uiprobe-core

use std::fmt::Write;
use thiserror::Error;

use crate::oracle::Mismatch;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for uiprobe-core
///
/// `Unavailable` (infrastructure) is deliberately separate from `Mismatch`
/// (the two sides answered and disagree) and `Instability` (the classifier
/// counted more glitches than the caller allowed).
#[derive(Error, Debug)]
pub enum Error {
    /// Rendered tree or authoritative control channel could not be reached
    #[error("Infrastructure unavailable: {0}")]
    Unavailable(#[from] UnavailableError),

    /// Control channel answered with output we could not interpret
    #[error("Failed to parse control output: {0}")]
    Parse(String),

    /// Invalid selector in options or config
    #[error("Selector error: {0}")]
    Selector(#[from] SelectorError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Glitch counters exceeded the caller's budget
    #[error("UI instability detected: {summary}\n{timeline}")]
    Instability { summary: String, timeline: String },

    /// Authoritative and rendered state still disagree after retry exhaustion
    #[error("Consistency mismatch after {attempts} attempt(s): {}", render_mismatches(.mismatches))]
    Mismatch {
        mismatches: Vec<Mismatch>,
        attempts: u32,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, lock poisoning)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

fn render_mismatches(mismatches: &[Mismatch]) -> String {
    let mut out = String::new();
    for m in mismatches {
        let _ = write!(out, "\n  {m}");
    }
    out
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Unavailable(err) => Some(err.remediation()),
            Self::Selector(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Parse(_) => Some(
                Remediation::new("tmux returned unexpected output; verify the tmux version.")
                    .command("Check version", "tmux -V")
                    .command("Raw pane list", "tmux list-panes -a")
                    .alternative("Upgrade tmux if the format strings changed."),
            ),
            Self::Instability { .. } => Some(
                Remediation::new(
                    "Inspect the timeline above for the flickering or churning element.",
                )
                .alternative("Raise the size jump threshold for operations that resize on purpose.")
                .alternative("Add live-content subtrees to the ignore list."),
            ),
            Self::Mismatch { .. } => Some(
                Remediation::new(
                    "Rendered state did not converge to tmux state within the timeout.",
                )
                .command("Authoritative state", "uiprobe snapshot")
                .alternative("Raise consistency.timeout_ms if the UI is merely slow."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the recording or snapshot file exists and is readable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => None,
        }
    }
}

/// Errors for an unreachable rendered tree or authoritative channel
#[derive(Error, Debug)]
pub enum UnavailableError {
    /// tmux binary not found
    #[error("tmux binary not found: {0}")]
    CliNotFound(String),

    /// tmux server is not running or the session does not exist
    #[error("tmux server or session not available: {0}")]
    NotRunning(String),

    /// Command execution failed with stderr output
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Rendered tree could not be queried (page closed, transport dropped)
    #[error("Rendered tree unreachable: {0}")]
    TreeUnreachable(String),

    /// A source did not answer before the deadline
    #[error("{source_name} did not respond within {timeout_ms} ms")]
    Timeout {
        source_name: String,
        timeout_ms: u64,
    },
}

impl UnavailableError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::CliNotFound(_) => Remediation::new("Install tmux and ensure it is on PATH.")
                .command("Verify install", "tmux -V")
                .alternative("Set tmux.binary in uiprobe.toml to the tmux path."),
            Self::NotRunning(_) => {
                Remediation::new("Start the tmux server/session under test and retry.")
                    .command("List sessions", "tmux ls")
                    .alternative("Set tmux.session or tmux.socket in uiprobe.toml.")
            }
            Self::CommandFailed(_) => Remediation::new("tmux command failed. Check stderr and retry.")
                .command("List panes", "tmux list-panes -a"),
            Self::TreeUnreachable(_) => Remediation::new(
                "The rendered page is not reachable. Check the browser driver connection.",
            )
            .alternative("Ensure the page was not navigated away mid-operation."),
            Self::Timeout { timeout_ms, .. } => Remediation::new(format!(
                "A snapshot source took longer than {timeout_ms} ms. Retry when the system is idle."
            ))
            .alternative("Raise consistency.timeout_ms."),
        }
    }
}

/// Selector parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,

    #[error("unexpected {found:?} at position {position} in selector {input:?}")]
    Unexpected {
        input: String,
        position: usize,
        found: char,
    },

    #[error("unexpected end of selector {input:?}")]
    UnexpectedEnd { input: String },
}

impl SelectorError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        Remediation::new(
            "Use the supported selector subset: tag, #id, .class, [attr], [attr=v], [attr^=v], [attr*=v], descendant and > combinators, comma lists.",
        )
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(_) => Remediation::new("Create uiprobe.toml or pass --config.")
                .alternative("Set UIPROBE_CONFIG to the config path."),
            Self::ReadFailed(_, _) => {
                Remediation::new("Check file permissions for the config file.")
            }
            Self::ParseFailed(_) | Self::SerializeFailed(_) => {
                Remediation::new("Fix the TOML syntax in uiprobe.toml.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Fix the reported value in uiprobe.toml and retry.")
            }
        }
    }
}
