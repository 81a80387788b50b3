//! User-facing error presentation for keel.
//!
//! Every failure the agent core surfaces (permission denials, patch
//! preconditions, transport exhaustion) is rendered through `EnhancedError`
//! so the message always carries actionable remediation text.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error with a title, a human-readable message and recovery suggestions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

/// Categories mirroring the agent core's error taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Missing API key, unreadable settings.
    Configuration,
    /// Tool server or provider transport failures.
    Network,
    /// Permission engine verdicts and rejected confirmations.
    Permission,
    /// Malformed tool-call blocks.
    Protocol,
    /// Patch preconditions and application failures.
    Patch,
    /// Cooperative cancellation.
    Cancelled,
    Unknown,
}

impl EnhancedError {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions.extend(suggestions);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "title": self.title,
            "message": self.message,
            "type": self.error_type,
            "suggestions": self.suggestions,
            "context": self.context,
        })
    }

    /// Format error for display
    pub fn format(&self, verbose: bool) -> String {
        let mut output = String::new();
        output.push_str(&format!("[{}] {}\n", self.error_type.label(), self.title));
        output.push_str(&format!("  {}\n", self.message));

        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {}\n", context));
        }

        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }

        output
    }
}

impl ErrorType {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "config",
            ErrorType::Network => "network",
            ErrorType::Permission => "permission",
            ErrorType::Protocol => "protocol",
            ErrorType::Patch => "patch",
            ErrorType::Cancelled => "cancelled",
            ErrorType::Unknown => "error",
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

/// Turns arbitrary errors into formatted, user-facing text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorHandler {
    verbose: bool,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &Error) -> String {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.format(self.verbose);
        }
        let chain = format!("{error:#}");
        self.classify_error(&chain).format(self.verbose)
    }

    /// Classify error based on message patterns
    fn classify_error(&self, error_message: &str) -> EnhancedError {
        let lower_error = error_message.to_lowercase();

        if lower_error.contains("api key") || lower_error.contains("settings") {
            return EnhancedError::new(
                "Configuration Error",
                error_message,
                ErrorType::Configuration,
            )
            .with_suggestions(vec![
                "Check .keel/settings.json and ~/.keel/settings.json".to_string(),
                "Set the KEEL_API_KEY environment variable".to_string(),
            ]);
        }

        if lower_error.contains("network")
            || lower_error.contains("timeout")
            || lower_error.contains("timed out")
            || lower_error.contains("connection")
        {
            return EnhancedError::new("Network Error", error_message, ErrorType::Network)
                .with_suggestions(vec![
                    "Check that the endpoint is reachable".to_string(),
                    "Try again in a few moments".to_string(),
                ]);
        }

        if lower_error.contains("permission") || lower_error.contains("denied") {
            return EnhancedError::new("Permission Error", error_message, ErrorType::Permission)
                .with_suggestion("Review rules with `keel permissions list`");
        }

        if lower_error.contains("cancelled") {
            return EnhancedError::new("Cancelled", error_message, ErrorType::Cancelled);
        }

        EnhancedError::new("Error", error_message, ErrorType::Unknown)
    }
}

/// Constructors for the errors the agent core surfaces most often.
pub mod errors {
    use super::*;

    pub fn missing_api_key(env_var: &str) -> EnhancedError {
        EnhancedError::new(
            "Missing API Key",
            "A chat provider API key is required.",
            ErrorType::Configuration,
        )
        .with_suggestions(vec![
            format!("Set the {env_var} environment variable"),
            "Add 'llm.api_key' to .keel/settings.json".to_string(),
        ])
    }

    pub fn vcs_required(workspace: &str) -> EnhancedError {
        EnhancedError::new(
            "Version Control Required",
            format!("'{workspace}' is not inside a git working tree; patches are never written without one."),
            ErrorType::Patch,
        )
        .with_suggestions(vec![
            "Run `git init` in the workspace root".to_string(),
            "Commit or stash current work so changes can be reverted".to_string(),
        ])
    }

    pub fn path_traversal(path: &str) -> EnhancedError {
        EnhancedError::new(
            "Unsafe Patch Path",
            format!("Patch header path '{path}' is absolute or escapes the workspace."),
            ErrorType::Patch,
        )
        .with_suggestion("Ask for a diff with paths relative to the workspace root")
    }

    pub fn patch_conflict(conflicts: &[String]) -> EnhancedError {
        EnhancedError::new(
            "Patch Does Not Apply",
            "The version-control check rejected the patch.",
            ErrorType::Patch,
        )
        .with_context(conflicts.join("\n"))
        .with_suggestions(vec![
            "Re-read the affected files and ask for a fresh diff".to_string(),
            "Discard the pending patch if it is stale".to_string(),
        ])
    }

    pub fn permission_denied(subject: &str) -> EnhancedError {
        EnhancedError::new(
            "Permission Denied",
            format!("A permission rule denied '{subject}'."),
            ErrorType::Permission,
        )
        .with_suggestions(vec![
            "Review rules with `keel permissions list`".to_string(),
            "Remove the rule with `keel permissions remove <index>`".to_string(),
        ])
    }
}
