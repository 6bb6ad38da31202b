//! Data carried through the validate, build and execute pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Script source as submitted by the caller.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    /// Raw source text.
    pub code: String,
    /// Bare statements to be wrapped into `main`, rather than a full module.
    pub inline: bool,
}

impl ScriptSource {
    /// Build a source from the caller's `code_type` marker.
    ///
    /// `"inline"` means bare statements; anything else is a full module.
    pub fn new(code: impl Into<String>, code_type: Option<&str>) -> Self {
        Self {
            code: code.into(),
            inline: code_type == Some("inline"),
        }
    }
}

/// A reusable helper exposed to scripts under `Functions.<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptFunction {
    /// Caller-side identifier.
    #[serde(default)]
    pub id: String,
    /// Name the helper is registered and invoked under.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Grouping used by the caller's UI.
    #[serde(default)]
    pub category: String,
    /// Declared parameters. Informational only.
    #[serde(default)]
    pub parameters: Vec<FunctionParameter>,
    /// Declared return type. Informational only.
    #[serde(default)]
    pub return_type: String,
    /// Untrusted JavaScript declaring a function named `name`.
    pub code: String,
    /// Example invocation.
    #[serde(default)]
    pub usage_example: String,
    /// Whether the helper ships with the platform.
    #[serde(default)]
    pub is_system: bool,
}

/// A declared parameter of a [`ScriptFunction`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameter {
    /// Parameter name.
    pub name: String,
    /// Declared type, e.g. `"string"`.
    #[serde(default, rename = "type")]
    pub param_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Whether callers must pass it.
    #[serde(default)]
    pub required: bool,
    /// Value used when omitted.
    #[serde(default, rename = "defaultValue", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// Everything a single execution needs. Built fresh per request.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    /// Workspace the script runs on behalf of.
    pub workspace_slug: String,
    /// The `AutomationEventInput` payload (`event` + `context`), exposed as `event`.
    pub input: Value,
    /// Environment variables, exposed frozen as `env`.
    pub env: HashMap<String, String>,
    /// Execution variables, exposed frozen as `variables` and passed to `main`.
    pub variables: serde_json::Map<String, Value>,
    /// Domains `fetch` may reach. Empty denies everything.
    pub allowed_domains: Vec<String>,
    /// Caller credential for the workspace API. Never enters the isolate.
    pub access_token: String,
    /// Base URL of the workspace API.
    pub api_base_url: String,
    /// Helpers to compile into the `Functions` namespace.
    pub functions: Vec<ScriptFunction>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workspace_slug", &self.workspace_slug)
            .field("input", &self.input)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("variables", &self.variables)
            .field("allowed_domains", &self.allowed_domains)
            .field("access_token", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Identifiers used only for log correlation.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Workspace the execution belongs to.
    pub workspace_slug: String,
    /// Task identifier, `"sync"` for synchronous executions.
    pub task_id: String,
    /// Execution identifier, prefixed onto every console line.
    pub execution_id: String,
}

/// The value a script's `main` resolved to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// JSON value; `undefined` becomes `null`.
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_source_inline_marker() {
        assert!(ScriptSource::new("return 1;", Some("inline")).inline);
        assert!(!ScriptSource::new("export function main() {}", Some("module")).inline);
        assert!(!ScriptSource::new("export function main() {}", None).inline);
    }

    #[test]
    fn script_function_wire_format() {
        let json = serde_json::json!({
            "id": "f1",
            "name": "slugify",
            "description": "",
            "category": "text",
            "parameters": [
                {"name": "s", "type": "string", "description": "", "required": false, "defaultValue": "x"}
            ],
            "return_type": "string",
            "code": "function slugify(s) { return s; }",
            "usage_example": "Functions.slugify('A B')",
            "is_system": true
        });
        let f: ScriptFunction = serde_json::from_value(json).unwrap();
        assert_eq!(f.name, "slugify");
        assert_eq!(f.parameters[0].param_type, "string");
        assert_eq!(f.parameters[0].default_value, Some(serde_json::json!("x")));
        assert!(f.is_system);

        let back = serde_json::to_value(&f).unwrap();
        assert_eq!(back["parameters"][0]["defaultValue"], "x");
        assert_eq!(back["return_type"], "string");
    }

    #[test]
    fn script_function_minimal_fields() {
        let f: ScriptFunction =
            serde_json::from_value(serde_json::json!({"name": "a", "code": "function a() {}"}))
                .unwrap();
        assert!(f.parameters.is_empty());
        assert!(!f.is_system);
    }

    #[test]
    fn execution_context_debug_hides_token() {
        let ctx = ExecutionContext {
            access_token: "super-secret-token".into(),
            ..Default::default()
        };
        let out = format!("{ctx:?}");
        assert!(!out.contains("super-secret-token"));
        assert!(out.contains("[REDACTED]"));
    }
}
