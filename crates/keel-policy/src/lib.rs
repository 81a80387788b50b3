mod matcher;

use keel_core::{
    AppConfig, PermissionAction, PermissionRule, PermissionsConfig, SKIP_PERMISSIONS_ENV,
    read_settings_file, write_settings_file,
};
use keel_observe::{ObserveEvent, Observer};
use matcher::{RuleFit, rule_fits, validate_rule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tool id used when the bridge asks about an external tool-server call.
pub const MCP_TOOL: &str = "mcp";
/// Tool id used for patch commits and reverts.
pub const PATCH_TOOL: &str = "fs_patch";

/// What is being asked for: a tool, and optionally the path or command it
/// would touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionQuery {
    pub tool: String,
    pub path: Option<String>,
    pub command: Option<String>,
}

impl PermissionQuery {
    pub fn tool(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            path: None,
            command: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    fn subject(&self) -> String {
        self.command
            .clone()
            .or_else(|| self.path.clone())
            .unwrap_or_else(|| self.tool.clone())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("failed to load permission settings: {0}")]
    Settings(String),
    #[error("invalid pathGlob '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },
    #[error("invalid commandPattern '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

impl From<anyhow::Error> for PolicyError {
    fn from(err: anyhow::Error) -> Self {
        Self::Settings(format!("{err:#}"))
    }
}

/// Where a verdict came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DecisionSource {
    /// Prompts are disabled process-wide or by configuration.
    Override,
    Rule { index: usize },
    Default { tool: String },
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: PermissionAction,
    #[serde(flatten)]
    pub source: DecisionSource,
}

/// A rule together with the settings layer that declared it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveRule {
    pub rule: PermissionRule,
    pub layer: PathBuf,
}

/// Rule-based authorization gate.
///
/// Settings are re-read from disk on every query so concurrent edits made
/// by another process are honored without a reload step.
pub struct PermissionEngine {
    /// Settings layers, lowest precedence first.
    layers: Vec<PathBuf>,
    /// The layer `set_default`/`add_rule`/`remove_rule` write to.
    project_path: PathBuf,
    skip_prompts: bool,
    observer: Arc<Observer>,
}

impl PermissionEngine {
    pub fn new(workspace: &Path) -> Self {
        Self::with_layers(
            AppConfig::layer_paths(workspace),
            AppConfig::project_settings_path(workspace),
        )
    }

    pub fn with_layers(layers: Vec<PathBuf>, project_path: PathBuf) -> Self {
        Self {
            layers,
            project_path,
            skip_prompts: false,
            observer: Arc::new(Observer::silent()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Process-level override, e.g. from `--dangerously-skip-permissions`.
    pub fn set_skip_prompts(&mut self, skip: bool) {
        self.skip_prompts = skip;
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Verdict for `query`. Settings that cannot be loaded fail closed.
    pub fn check(&self, query: &PermissionQuery) -> PermissionAction {
        let action = match self.evaluate(query) {
            Ok(decision) => decision.action,
            Err(err) => {
                self.observer
                    .warn_log(&format!("permission check failed closed: {err}"));
                PermissionAction::Deny
            }
        };
        self.observer.record(&ObserveEvent::PermissionDecided {
            tool: query.tool.clone(),
            subject: query.subject(),
            verdict: action.to_string(),
        });
        action
    }

    pub fn evaluate(&self, query: &PermissionQuery) -> Result<Decision, PolicyError> {
        if self.skip_prompts || env_skip_prompts() {
            return Ok(Decision {
                action: PermissionAction::Allow,
                source: DecisionSource::Override,
            });
        }

        let effective = self.load()?;
        if effective.skip_prompts {
            return Ok(Decision {
                action: PermissionAction::Allow,
                source: DecisionSource::Override,
            });
        }

        for (index, rule) in effective.rules.iter().enumerate() {
            match rule_fits(&rule.rule.matcher, query) {
                RuleFit::Matches => {
                    return Ok(Decision {
                        action: rule.rule.action,
                        source: DecisionSource::Rule { index },
                    });
                }
                RuleFit::Misses => {}
                RuleFit::Invalid(reason) => {
                    self.observer
                        .warn_log(&format!("skipping permission rule {index}: {reason}"));
                }
            }
        }

        if let Some(action) = effective.defaults.get(&query.tool) {
            return Ok(Decision {
                action: *action,
                source: DecisionSource::Default {
                    tool: query.tool.clone(),
                },
            });
        }

        Ok(Decision {
            action: PermissionAction::Allow,
            source: DecisionSource::Fallback,
        })
    }

    /// Rules in evaluation order: higher-precedence layers first, each
    /// layer's own order preserved.
    pub fn rules(&self) -> Result<Vec<EffectiveRule>, PolicyError> {
        Ok(self.load()?.rules)
    }

    pub fn defaults(&self) -> Result<BTreeMap<String, PermissionAction>, PolicyError> {
        Ok(self.load()?.defaults)
    }

    pub fn set_default(&self, tool: &str, action: PermissionAction) -> Result<(), PolicyError> {
        self.update_project(|permissions| {
            permissions.defaults.insert(tool.to_string(), action);
            true
        })
        .map(|_| ())
    }

    pub fn add_rule(&self, rule: PermissionRule) -> Result<(), PolicyError> {
        validate_rule(&rule.matcher)?;
        self.update_project(|permissions| {
            permissions.rules.push(rule);
            true
        })
        .map(|_| ())
    }

    /// Removes the project-layer rule at `index`. Out of range is a no-op
    /// that reports `false`.
    pub fn remove_rule(&self, index: usize) -> Result<bool, PolicyError> {
        self.update_project(|permissions| {
            if index >= permissions.rules.len() {
                return false;
            }
            permissions.rules.remove(index);
            true
        })
    }

    fn load(&self) -> Result<EffectivePermissions, PolicyError> {
        let mut effective = EffectivePermissions::default();
        for layer in &self.layers {
            let value = read_settings_file(layer)?;
            let permissions = parse_permissions(&value, layer)?;
            let mut layer_rules: Vec<EffectiveRule> = permissions
                .rules
                .into_iter()
                .map(|rule| EffectiveRule {
                    rule,
                    layer: layer.clone(),
                })
                .collect();
            // Later layers take precedence, so their rules are consulted first.
            layer_rules.append(&mut effective.rules);
            effective.rules = layer_rules;
            effective.defaults.extend(permissions.defaults);
            effective.skip_prompts |= permissions.skip_prompts;
        }
        Ok(effective)
    }

    /// Read-modify-write of the project layer. Keys outside `permissions`
    /// are preserved. The file is only written when `edit` reports a change.
    fn update_project(
        &self,
        edit: impl FnOnce(&mut PermissionsConfig) -> bool,
    ) -> Result<bool, PolicyError> {
        let mut root = read_settings_file(&self.project_path)?;
        let mut permissions = parse_permissions(&root, &self.project_path)?;
        if !edit(&mut permissions) {
            return Ok(false);
        }
        let encoded = serde_json::to_value(&permissions)
            .map_err(|err| PolicyError::Settings(err.to_string()))?;
        match root.as_object_mut() {
            Some(object) => {
                object.insert("permissions".to_string(), encoded);
            }
            None => {
                root = serde_json::json!({ "permissions": encoded });
            }
        }
        write_settings_file(&self.project_path, &root)?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct EffectivePermissions {
    rules: Vec<EffectiveRule>,
    defaults: BTreeMap<String, PermissionAction>,
    skip_prompts: bool,
}

fn parse_permissions(
    root: &serde_json::Value,
    layer: &Path,
) -> Result<PermissionsConfig, PolicyError> {
    match root.get("permissions") {
        None | Some(serde_json::Value::Null) => Ok(PermissionsConfig::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
            PolicyError::Settings(format!("invalid permissions in {}: {err}", layer.display()))
        }),
    }
}

fn env_skip_prompts() -> bool {
    std::env::var(SKIP_PERMISSIONS_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::RuleMatch;
    use serde_json::json;

    fn engine_with(project: serde_json::Value) -> (tempfile::TempDir, PermissionEngine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let project_path = dir.path().join("project.json");
        write_settings_file(&project_path, &project).expect("write");
        let engine = PermissionEngine::with_layers(vec![project_path.clone()], project_path);
        (dir, engine)
    }

    #[test]
    fn first_matching_rule_wins_over_later_specificity() {
        let (_dir, engine) = engine_with(json!({
            "permissions": {"rules": [
                {"match": {"tool": "fs_patch", "pathGlob": "/project/**"}, "action": "deny"},
                {"match": {"tool": "fs_patch"}, "action": "allow"}
            ]}
        }));
        let query = PermissionQuery::tool("fs_patch").with_path("/project/x");
        assert_eq!(engine.check(&query), PermissionAction::Deny);
        assert_eq!(
            engine.evaluate(&query).expect("evaluate").source,
            DecisionSource::Rule { index: 0 }
        );
        assert_eq!(
            engine.check(&PermissionQuery::tool("fs_patch").with_path("/other/x")),
            PermissionAction::Allow
        );
    }

    #[test]
    fn defaults_apply_when_no_rule_matches() {
        let (_dir, engine) = engine_with(json!({
            "permissions": {"rules": [], "defaults": {"fs_patch": "confirm"}}
        }));
        assert_eq!(
            engine.check(&PermissionQuery::tool("fs_patch")),
            PermissionAction::Confirm
        );
        let other = engine.evaluate(&PermissionQuery::tool("other")).expect("evaluate");
        assert_eq!(other.action, PermissionAction::Allow);
        assert_eq!(other.source, DecisionSource::Fallback);
    }

    #[test]
    fn config_skip_prompts_allows_everything() {
        let (_dir, engine) = engine_with(json!({
            "permissions": {
                "skip_prompts": true,
                "rules": [{"match": {"tool": "mcp"}, "action": "deny"}]
            }
        }));
        assert_eq!(
            engine.check(&PermissionQuery::tool("mcp").with_command("rm")),
            PermissionAction::Allow
        );
    }

    #[test]
    fn process_override_allows_everything() {
        let (_dir, mut engine) = engine_with(json!({
            "permissions": {"defaults": {"mcp": "deny"}}
        }));
        assert_eq!(engine.check(&PermissionQuery::tool("mcp")), PermissionAction::Deny);
        engine.set_skip_prompts(true);
        assert_eq!(engine.check(&PermissionQuery::tool("mcp")), PermissionAction::Allow);
    }

    #[test]
    fn unreadable_settings_fail_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project_path = dir.path().join("broken.json");
        std::fs::write(&project_path, "{not json").expect("write");
        let engine = PermissionEngine::with_layers(vec![project_path.clone()], project_path);
        assert_eq!(engine.check(&PermissionQuery::tool("mcp")), PermissionAction::Deny);
        assert!(matches!(
            engine.evaluate(&PermissionQuery::tool("mcp")),
            Err(PolicyError::Settings(_))
        ));
    }

    #[test]
    fn project_rules_are_consulted_before_global_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        write_settings_file(
            &global,
            &json!({"permissions": {
                "rules": [{"match": {"tool": "mcp"}, "action": "deny"}],
                "defaults": {"fs_patch": "deny", "mcp": "deny"}
            }}),
        )
        .expect("write global");
        write_settings_file(
            &project,
            &json!({"permissions": {
                "rules": [{"match": {"tool": "mcp", "commandPattern": "^read_"}, "action": "allow"}],
                "defaults": {"fs_patch": "confirm"}
            }}),
        )
        .expect("write project");
        let engine = PermissionEngine::with_layers(vec![global, project.clone()], project);

        let read = PermissionQuery::tool("mcp").with_command("read_file");
        let write = PermissionQuery::tool("mcp").with_command("write_file");
        assert_eq!(engine.check(&read), PermissionAction::Allow);
        assert_eq!(engine.check(&write), PermissionAction::Deny);
        assert_eq!(
            engine.check(&PermissionQuery::tool("fs_patch")),
            PermissionAction::Confirm
        );
        assert_eq!(engine.rules().expect("rules").len(), 2);
    }

    #[test]
    fn mutations_preserve_unrelated_settings() {
        let (dir, engine) = engine_with(json!({"agent": {"bridge_enabled": false}}));
        engine
            .add_rule(PermissionRule {
                matcher: RuleMatch {
                    tool: Some("mcp".to_string()),
                    path_glob: None,
                    command_pattern: Some("^deploy".to_string()),
                },
                action: PermissionAction::Confirm,
            })
            .expect("add rule");
        engine
            .set_default("fs_patch", PermissionAction::Confirm)
            .expect("set default");

        let saved = read_settings_file(&dir.path().join("project.json")).expect("read");
        assert_eq!(saved["agent"]["bridge_enabled"], false);
        assert_eq!(saved["permissions"]["rules"][0]["match"]["commandPattern"], "^deploy");
        assert_eq!(saved["permissions"]["defaults"]["fs_patch"], "confirm");
        assert_eq!(
            engine.check(&PermissionQuery::tool("mcp").with_command("deploy_prod")),
            PermissionAction::Confirm
        );
    }

    #[test]
    fn remove_rule_out_of_range_is_a_silent_no_op() {
        let (dir, engine) = engine_with(json!({
            "permissions": {"rules": [{"match": {"tool": "mcp"}, "action": "deny"}]}
        }));
        let before = std::fs::read_to_string(dir.path().join("project.json")).expect("read");
        assert!(!engine.remove_rule(5).expect("remove"));
        let after = std::fs::read_to_string(dir.path().join("project.json")).expect("read");
        assert_eq!(before, after);

        assert!(engine.remove_rule(0).expect("remove"));
        assert!(engine.rules().expect("rules").is_empty());
    }

    #[test]
    fn add_rule_rejects_invalid_patterns() {
        let (_dir, engine) = engine_with(json!({}));
        let err = engine
            .add_rule(PermissionRule {
                matcher: RuleMatch {
                    tool: None,
                    path_glob: Some("[".to_string()),
                    command_pattern: None,
                },
                action: PermissionAction::Deny,
            })
            .expect_err("invalid glob");
        assert!(matches!(err, PolicyError::InvalidGlob { .. }));
    }

    #[test]
    fn edits_made_by_another_writer_are_seen_on_next_check() {
        let (dir, engine) = engine_with(json!({}));
        assert_eq!(engine.check(&PermissionQuery::tool("mcp")), PermissionAction::Allow);
        write_settings_file(
            &dir.path().join("project.json"),
            &json!({"permissions": {"defaults": {"mcp": "deny"}}}),
        )
        .expect("external edit");
        assert_eq!(engine.check(&PermissionQuery::tool("mcp")), PermissionAction::Deny);
    }
}
