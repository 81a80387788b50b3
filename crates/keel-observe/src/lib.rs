use anyhow::Result;
use chrono::Utc;
use keel_core::{TurnState, runtime_dir};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Structured events recorded by the agent core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObserveEvent {
    TurnStarted {
        turn: u64,
        chars: usize,
    },
    TurnCompleted {
        turn: u64,
        cycles: u32,
        duration_ms: u64,
    },
    StateChanged {
        from: TurnState,
        to: TurnState,
    },
    ToolCallDispatched {
        server: String,
        tool_name: String,
    },
    ToolCallFinished {
        server: String,
        tool_name: String,
        outcome: String,
        duration_ms: u64,
    },
    ToolCallMalformed {
        reason: String,
    },
    PermissionDecided {
        tool: String,
        subject: String,
        verdict: String,
    },
    PatchProposed {
        target_files: Vec<String>,
    },
    PatchCommitted {
        entry_id: String,
        target_files: Vec<String>,
    },
    PatchReverted {
        entry_id: String,
    },
    HistoryCompacted {
        dropped: usize,
        kept: usize,
    },
}

/// Append-only log under the runtime directory plus an optional stderr
/// mirror. Logging failures are swallowed; they never abort the caller.
pub struct Observer {
    log_path: Option<PathBuf>,
    verbose: bool,
    write_lock: Mutex<()>,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: Some(dir.join("observe.log")),
            verbose: false,
            write_lock: Mutex::new(()),
        })
    }

    /// An observer that records nothing.
    pub fn silent() -> Self {
        Self {
            log_path: None,
            verbose: false,
            write_lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Enable or disable verbose logging to stderr.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn record(&self, event: &ObserveEvent) {
        let encoded = match serde_json::to_string(event) {
            Ok(encoded) => encoded,
            Err(_) => return,
        };
        if self.verbose {
            eprintln!("[keel] {encoded}");
        }
        let _ = self.append_log_line(&format!("{} EVENT {encoded}", Utc::now().to_rfc3339()));
    }

    /// Log a message to stderr with `[keel]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[keel] {msg}");
            let _ = self.append_log_line(&format!("{} DEBUG {msg}", Utc::now().to_rfc3339()));
        }
    }

    /// Log a warning. Always written to the log file and mirrored to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[keel WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().map_err(|_| anyhow::anyhow!("log lock poisoned"))?;
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::silent()
    }
}
