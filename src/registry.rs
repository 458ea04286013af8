//! Capability registry — agents and capabilities are collaborator-owned
//! configuration (spec §6.4 "projects/tasks... not owned by the core"); this
//! worker only needs to resolve a `capability_id` to the record it carries
//! (argument schema, timeout, danger level, command/prompt template). Loaded
//! once at startup from a TOML file, keyed by UUID, rather than from a table
//! this core would otherwise have to own and migrate.

use crate::model::{AgentKind, Capability, InteractionMode};
use crate::safety::ArgSpec;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct RawArgSpec {
    name: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCapability {
    id: Uuid,
    agent_id: Uuid,
    agent_kind: String,
    interaction_mode: String,
    #[serde(default = "default_timeout")]
    timeout_sec: u64,
    #[serde(default = "default_max_output")]
    max_output_bytes: u64,
    idle_timeout_sec: Option<u64>,
    command_template: Option<Vec<String>>,
    prompt_template: Option<String>,
    #[serde(default)]
    arg_schema: Vec<RawArgSpec>,
    #[serde(default = "default_danger_level")]
    danger_level: String,
    #[serde(default)]
    env_allowlist: Vec<String>,
    #[serde(default)]
    credential_dir: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    300
}
fn default_max_output() -> u64 {
    10 * 1024 * 1024
}
fn default_danger_level() -> String {
    "medium".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct RawRegistry {
    #[serde(default)]
    capability: Vec<RawCapability>,
}

#[derive(Clone)]
pub struct CapabilityRegistry {
    by_id: HashMap<Uuid, Capability>,
}

impl CapabilityRegistry {
    pub fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    pub fn load_from_toml(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading capability registry {}", path.display()))?;
        let raw: RawRegistry = toml::from_str(&contents)
            .with_context(|| format!("parsing capability registry {}", path.display()))?;

        let mut by_id = HashMap::new();
        for cap in raw.capability {
            let agent_kind = match cap.agent_kind.as_str() {
                "claude" => AgentKind::Claude,
                "codex" => AgentKind::Codex,
                "gemini" => AgentKind::Gemini,
                other => anyhow::bail!("unknown agent_kind '{other}' in capability registry"),
            };
            let interaction_mode = match cap.interaction_mode.as_str() {
                "prompt" => InteractionMode::Prompt,
                "template" => InteractionMode::Template,
                other => anyhow::bail!("unknown interaction_mode '{other}' in capability registry"),
            };
            let arg_schema = cap
                .arg_schema
                .into_iter()
                .map(|a| ArgSpec {
                    name: a.name,
                    required: a.required,
                    pattern: a.pattern,
                })
                .collect();
            by_id.insert(
                cap.id,
                Capability {
                    id: cap.id,
                    agent_id: cap.agent_id,
                    agent_kind,
                    interaction_mode,
                    timeout_sec: cap.timeout_sec,
                    max_output_bytes: cap.max_output_bytes,
                    idle_timeout_sec: cap.idle_timeout_sec,
                    command_template: cap.command_template,
                    prompt_template: cap.prompt_template,
                    arg_schema,
                    danger_level: cap.danger_level,
                    env_allowlist: cap.env_allowlist,
                    credential_dir: cap.credential_dir,
                },
            );
        }
        Ok(Self { by_id })
    }

    pub fn get(&self, id: Uuid) -> Option<&Capability> {
        self.by_id.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_registry() {
        let registry = CapabilityRegistry::load_from_toml(Path::new("/nonexistent/reg.toml")).unwrap();
        assert!(registry.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn parses_one_prompt_capability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        let id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                "[[capability]]\nid = \"{id}\"\nagent_id = \"{agent_id}\"\nagent_kind = \"claude\"\ninteraction_mode = \"prompt\"\ntimeout_sec = 120\n"
            ),
        )
        .unwrap();
        let registry = CapabilityRegistry::load_from_toml(&path).unwrap();
        let cap = registry.get(id).unwrap();
        assert_eq!(cap.timeout_sec, 120);
        assert!(matches!(cap.agent_kind, AgentKind::Claude));
        assert!(matches!(cap.interaction_mode, InteractionMode::Prompt));
    }
}
