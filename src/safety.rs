//! Safety gate — validates everything that goes into a spawned child before
//! it is spawned. The child runs without a shell; quoting is never the
//! defense here, validation is.

use crate::error::ValidationError;
use crate::storage::Storage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Fixed environment keys every child inherits regardless of agent.
const BASE_ENV_KEYS: &[&str] = &["PATH", "HOME", "TERM", "COLORTERM", "LANG", "LC_ALL"];

/// Resolve symlinks and compare against an allowlist of canonical roots.
/// An exact match or a strict-prefix match (followed by a path separator)
/// under an allowlist entry is accepted.
pub fn validate_working_dir(
    path: &Path,
    allowlist: &[PathBuf],
) -> Result<PathBuf, ValidationError> {
    if !path.is_absolute() {
        return Err(ValidationError::NotAbsolute(path.display().to_string()));
    }
    let canonical = path
        .canonicalize()
        .map_err(|_| ValidationError::NotExist(path.display().to_string()))?;

    for root in allowlist {
        let root = match root.canonicalize() {
            Ok(r) => r,
            Err(_) => continue,
        };
        if canonical == root || canonical.starts_with(&root) {
            return Ok(canonical);
        }
    }
    Err(ValidationError::NotInAllowlist(
        canonical.display().to_string(),
    ))
}

/// `validate_working_dir`, falling back to the database-backed project-root
/// list when the static allowlist misses (spec §4.1). The static check is
/// tried first since it never touches the database; the fallback query only
/// runs on a miss.
pub async fn validate_working_dir_with_fallback(
    path: &Path,
    allowlist: &[PathBuf],
    storage: &Storage,
) -> Result<PathBuf, ValidationError> {
    match validate_working_dir(path, allowlist) {
        Ok(resolved) => Ok(resolved),
        Err(ValidationError::NotInAllowlist(_)) => {
            let extra: Vec<PathBuf> = storage
                .list_project_roots()
                .await
                .unwrap_or_default()
                .into_iter()
                .map(PathBuf::from)
                .collect();
            validate_working_dir(path, &extra)
        }
        Err(e) => Err(e),
    }
}

/// `validateBinary` — confirm the path exists and is executable (unix mode
/// bit). On platforms without unix permission bits this degrades to an
/// existence check.
pub fn validate_binary(path: &Path) -> Result<(), ValidationError> {
    let meta = std::fs::metadata(path)
        .map_err(|_| ValidationError::NotExecutable(path.display().to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(ValidationError::NotExecutable(path.display().to_string()));
        }
    }
    if !meta.is_file() {
        return Err(ValidationError::NotExecutable(path.display().to_string()));
    }
    Ok(())
}

/// Build the child's environment from a fixed small whitelist plus exactly
/// the agent-declared extra keys. Never spreads the parent environment.
pub fn build_child_env(agent_allowlist: &[String]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in BASE_ENV_KEYS {
        if let Ok(val) = std::env::var(key) {
            env.insert(key.to_string(), val);
        }
    }
    for key in agent_allowlist {
        if let Ok(val) = std::env::var(key) {
            env.insert(key.clone(), val);
        }
    }
    env
}

/// Declares what an argument schema field requires.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub required: bool,
    /// Optional regex the scalar value must fully match.
    pub pattern: Option<String>,
}

/// `validateArgs` — scalars only, pattern constraints applied per field.
pub fn validate_args(
    schema: &[ArgSpec],
    args: &HashMap<String, serde_json::Value>,
) -> Result<(), ValidationError> {
    for spec in schema {
        let value = args.get(&spec.name);
        match value {
            None => {
                if spec.required {
                    return Err(ValidationError::MissingRequired(spec.name.clone()));
                }
                continue;
            }
            Some(v) => {
                let scalar = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => return Err(ValidationError::NonScalar(spec.name.clone())),
                };
                if let Some(pattern) = &spec.pattern {
                    let re = Regex::new(pattern)
                        .map_err(|_| ValidationError::PatternMismatch { field: spec.name.clone() })?;
                    if !re.is_match(&scalar) {
                        return Err(ValidationError::PatternMismatch { field: spec.name.clone() });
                    }
                }
            }
        }
    }
    Ok(())
}

static SHELL_META: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[;&|`$(){}<>\\\n]"#).unwrap());

/// `buildCommandArgs` — `{{name}}` tokens replaced as whole tokens; values
/// containing shell-meta characters are rejected even though no shell is
/// ever invoked, because a compromised downstream consumer (e.g. a `sh -c`
/// wrapper script the agent itself shells out to) should not be handed one.
pub fn build_command_args(
    tokens: &[String],
    args: &HashMap<String, String>,
) -> Result<Vec<String>, ValidationError> {
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(name) = token
            .strip_prefix("{{")
            .and_then(|t| t.strip_suffix("}}"))
        {
            let value = args
                .get(name)
                .ok_or_else(|| ValidationError::MissingToken(name.to_string()))?;
            if SHELL_META.is_match(value) {
                return Err(ValidationError::DisallowedChar {
                    field: name.to_string(),
                });
            }
            out.push(value.clone());
        } else {
            out.push(token.clone());
        }
    }
    Ok(out)
}

/// `interpolatePrompt` — replaces `{{dotted.path}}` with a resolved lookup
/// into `context`; missing keys become empty strings, never an error.
pub fn interpolate_prompt(template: &str, context: &serde_json::Value) -> String {
    static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([a-zA-Z0-9_.]+)\}\}").unwrap());
    TOKEN
        .replace_all(template, |caps: &regex::Captures| {
            let path = &caps[1];
            lookup_dotted(context, path)
                .map(render_scalar)
                .unwrap_or_default()
        })
        .into_owned()
}

fn lookup_dotted<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Redacts long base64/hex-looking runs before a tool call is written to the
/// append-only log, so captured transcripts can't leak pasted credentials.
pub fn sanitize_tool_input(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let mut run = 0;
        let mut j = i;
        while j < chars.len()
            && (chars[j].is_ascii_alphanumeric() || chars[j] == '+' || chars[j] == '/')
        {
            run += 1;
            j += 1;
        }
        if run >= 40 {
            result.push_str("[REDACTED]");
            i += run;
        } else {
            result.push(chars[i]);
            i += 1;
        }
    }
    result
}

/// Applies `sanitize_tool_input` to every string leaf of a JSON value —
/// tool inputs/results are arbitrary JSON, not flat strings, so the redaction
/// has to walk the tree rather than run on a single string.
pub fn sanitize_tool_input_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(sanitize_tool_input(s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_tool_input_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_tool_input_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_rejects_outside_path() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let allowlist = vec![dir.path().to_path_buf()];
        let err = validate_working_dir(outside.path(), &allowlist).unwrap_err();
        assert!(matches!(err, ValidationError::NotInAllowlist(_)));
    }

    #[test]
    fn allowlist_accepts_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let allowlist = vec![dir.path().to_path_buf()];
        assert!(validate_working_dir(&sub, &allowlist).is_ok());
    }

    #[test]
    fn relative_path_rejected() {
        let allowlist = vec![PathBuf::from("/tmp")];
        let err = validate_working_dir(Path::new("relative/dir"), &allowlist).unwrap_err();
        assert!(matches!(err, ValidationError::NotAbsolute(_)));
    }

    #[test]
    fn env_hygiene_only_allowlisted_keys() {
        std::env::set_var("AGENDO_TEST_SECRET", "shh");
        let env = build_child_env(&["AGENT_EXTRA".to_string()]);
        assert!(!env.contains_key("AGENDO_TEST_SECRET"));
        assert!(env.len() < 15);
    }

    #[test]
    fn build_command_args_rejects_shell_meta() {
        let tokens = vec!["run".to_string(), "{{target}}".to_string()];
        let mut args = HashMap::new();
        args.insert("target".to_string(), "foo; rm -rf /".to_string());
        let err = build_command_args(&tokens, &args).unwrap_err();
        assert!(matches!(err, ValidationError::DisallowedChar { .. }));
    }

    #[test]
    fn build_command_args_substitutes_whole_token() {
        let tokens = vec!["run".to_string(), "{{target}}".to_string()];
        let mut args = HashMap::new();
        args.insert("target".to_string(), "build".to_string());
        let out = build_command_args(&tokens, &args).unwrap();
        assert_eq!(out, vec!["run".to_string(), "build".to_string()]);
    }

    #[test]
    fn interpolate_prompt_resolves_dotted_path() {
        let ctx = serde_json::json!({"task": {"title": "fix bug"}});
        let out = interpolate_prompt("Please {{task.title}}", &ctx);
        assert_eq!(out, "Please fix bug");
    }

    #[test]
    fn interpolate_prompt_missing_key_is_empty() {
        let ctx = serde_json::json!({});
        let out = interpolate_prompt("Hello {{nope.nested}}!", &ctx);
        assert_eq!(out, "Hello !");
    }

    #[test]
    fn sanitize_long_base64_redacted() {
        let key = "A".repeat(44);
        let input = format!("curl -H 'Authorization: Bearer {}'", key);
        let result = sanitize_tool_input(&input);
        assert!(result.contains("[REDACTED]"));
        assert!(!result.contains(&key));
    }

    #[test]
    fn validate_args_requires_required_field() {
        let schema = vec![ArgSpec {
            name: "path".into(),
            required: true,
            pattern: None,
        }];
        let args = HashMap::new();
        let err = validate_args(&schema, &args).unwrap_err();
        assert!(matches!(err, ValidationError::MissingRequired(_)));
    }

    #[test]
    fn validate_args_pattern_mismatch() {
        let schema = vec![ArgSpec {
            name: "id".into(),
            required: true,
            pattern: Some(r"^[0-9]+$".into()),
        }];
        let mut args = HashMap::new();
        args.insert("id".to_string(), serde_json::json!("abc"));
        let err = validate_args(&schema, &args).unwrap_err();
        assert!(matches!(err, ValidationError::PatternMismatch { .. }));
    }
}
