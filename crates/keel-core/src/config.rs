use crate::runtime_dir;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Home directory used for the global settings layer. `KEEL_HOME` wins so
/// tests and sandboxes never touch the real home directory.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var("KEEL_HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .or_else(|| std::env::var("USERPROFILE").ok())
                .map(|home| Path::new(&home).join(".keel"))
        })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub permissions: PermissionsConfig,
    pub tool_servers: Vec<ToolServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    /// Retries for provider requests that fail before streaming starts.
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: "KEEL_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 4096,
            timeout_seconds: 120,
            max_retries: 2,
            retry_base_ms: 500,
        }
    }
}

fn default_max_tool_cycles() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Route detected tool-call blocks to the bridge.
    pub bridge_enabled: bool,
    /// Follow-up turns allowed per user instruction.
    #[serde(default = "default_max_tool_cycles")]
    pub max_tool_cycles: u32,
    /// Save a session snapshot after every settled turn.
    pub persist_sessions: bool,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bridge_enabled: true,
            max_tool_cycles: default_max_tool_cycles(),
            persist_sessions: true,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Confirm,
}

impl std::fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::Confirm => write!(f, "confirm"),
        }
    }
}

impl std::str::FromStr for PermissionAction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "confirm" | "ask" => Ok(Self::Confirm),
            other => Err(anyhow!(
                "invalid permission action '{}' (expected allow|deny|confirm)",
                other
            )),
        }
    }
}

/// Fields a rule matches on. Unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(rename = "pathGlob", alias = "path_glob", skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
    #[serde(
        rename = "commandPattern",
        alias = "command_pattern",
        skip_serializing_if = "Option::is_none"
    )]
    pub command_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub action: PermissionAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub rules: Vec<PermissionRule>,
    pub defaults: BTreeMap<String, PermissionAction>,
    pub skip_prompts: bool,
}

fn default_tool_server_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tool_server_timeout")]
    pub timeout_seconds: u64,
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join("settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    /// Layer paths from lowest to highest precedence.
    pub fn layer_paths(workspace: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        paths
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        for path in Self::layer_paths(workspace) {
            if !path.exists() {
                continue;
            }
            let value = read_settings_file(&path)?;
            merge_json_value(&mut merged, &value);
        }
        serde_json::from_value(merged).context("invalid keel settings")
    }

    /// Merges `tool_servers` across layers by id instead of replacing the
    /// array wholesale; the later layer wins on a duplicate id.
    pub fn load_tool_servers(workspace: &Path) -> Result<Vec<ToolServerConfig>> {
        let mut merged: BTreeMap<String, ToolServerConfig> = BTreeMap::new();
        for path in Self::layer_paths(workspace) {
            if !path.exists() {
                continue;
            }
            let value = read_settings_file(&path)?;
            let Some(servers) = value.get("tool_servers") else {
                continue;
            };
            let servers: Vec<ToolServerConfig> = serde_json::from_value(servers.clone())
                .with_context(|| format!("invalid tool_servers in {}", path.display()))?;
            for server in servers {
                merged.insert(server.id.clone(), server);
            }
        }
        Ok(merged.into_values().collect())
    }
}

/// Reads a settings layer. A missing file is an empty object.
pub fn read_settings_file(path: &Path) -> Result<serde_json::Value> {
    if !path.exists() {
        return Ok(serde_json::json!({}));
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_settings_file(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
