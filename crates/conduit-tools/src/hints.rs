//! Corrective guidance derived from a tool's input schema.

use serde_json::{Map, Value};

use conduit_types::ToolSchema;

const MAX_PARAM_LINES: usize = 80;
const MAX_ENUM_SHOWN: usize = 20;
const MAX_OPTIONAL_IN_EXAMPLE: usize = 3;
pub const MAX_ALTERNATIVES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgIssues {
    pub missing_required: Vec<String>,
    pub unknown_keys: Vec<String>,
    pub type_mismatches: Vec<(String, String, String)>,
    pub enum_violations: Vec<(String, Vec<Value>, Value)>,
}

impl ArgIssues {
    pub fn is_empty(&self) -> bool {
        self.missing_required.is_empty()
            && self.unknown_keys.is_empty()
            && self.type_mismatches.is_empty()
            && self.enum_violations.is_empty()
    }

    fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.missing_required.is_empty() {
            out.push(format!("missing required: {}", self.missing_required.join(", ")));
        }
        if !self.unknown_keys.is_empty() {
            out.push(format!("unknown keys: {}", self.unknown_keys.join(", ")));
        }
        if !self.type_mismatches.is_empty() {
            let parts = self
                .type_mismatches
                .iter()
                .map(|(key, expected, actual)| format!("{key} (expected {expected}, got {actual})"))
                .collect::<Vec<_>>();
            out.push(format!("type mismatches: {}", parts.join("; ")));
        }
        if !self.enum_violations.is_empty() {
            let parts = self
                .enum_violations
                .iter()
                .map(|(key, allowed, actual)| {
                    let allowed = allowed.iter().map(render_scalar).collect::<Vec<_>>();
                    format!("{key} (allowed {}, got {actual})", allowed.join("|"))
                })
                .collect::<Vec<_>>();
            out.push(format!("enum violations: {}", parts.join("; ")));
        }
        out
    }
}

/// Some servers wrap the JSON schema in an extra `schema` key.
fn object_schema(schema: &ToolSchema) -> Option<&Map<String, Value>> {
    let raw = &schema.input_schema;
    let inner = raw.get("schema").filter(|v| v.is_object()).unwrap_or(raw);
    inner.as_object().filter(|obj| !obj.is_empty())
}

fn properties(schema: &Map<String, Value>) -> Vec<(&String, &Value)> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.iter().collect())
        .unwrap_or_default()
}

fn required(schema: &Map<String, Value>) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn declared_types(prop: &Value) -> Vec<String> {
    match prop.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn primary_type(prop: &Value) -> String {
    declared_types(prop)
        .into_iter()
        .next()
        .or_else(|| {
            ["anyOf", "oneOf"].iter().find_map(|key| {
                prop.get(*key)
                    .and_then(|v| v.get(0))
                    .and_then(|v| v.get("type"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| "string".to_string())
}

fn example_value(kind: &str, prop: &Value) -> Value {
    let default = prop.get("default").cloned();
    match kind {
        "number" | "integer" => default.unwrap_or(Value::from(0)),
        "boolean" => default.unwrap_or(Value::Bool(false)),
        "array" => {
            if let Some(Value::Array(items)) = default {
                return Value::Array(items);
            }
            let item_schema = prop.get("items").cloned().unwrap_or(Value::Null);
            let item_kind = primary_type(&item_schema);
            Value::Array(vec![example_value(&item_kind, &item_schema)])
        }
        "object" => default
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new())),
        _ => prop
            .get("enum")
            .and_then(|v| v.get(0))
            .cloned()
            .or(default)
            .unwrap_or_else(|| Value::String(String::new())),
    }
}

fn actual_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn param_line(name: &str, prop: &Value, is_required: bool) -> String {
    let types = declared_types(prop);
    let type_str = if !types.is_empty() {
        types.join("|")
    } else if prop.get("anyOf").is_some() || prop.get("oneOf").is_some() {
        "anyOf/oneOf".to_string()
    } else {
        "unknown".to_string()
    };
    let mut line = format!("- {name} ({type_str})");
    if is_required {
        line.push_str(" [required]");
    }
    if let Some(values) = prop.get("enum").and_then(Value::as_array) {
        let shown = values
            .iter()
            .take(MAX_ENUM_SHOWN)
            .map(render_scalar)
            .collect::<Vec<_>>();
        line.push_str(&format!(" enum: {}", shown.join(", ")));
    }
    if let Some(default) = prop.get("default") {
        line.push_str(&format!(" default: {default}"));
    }
    if let Some(desc) = prop.get("description").and_then(Value::as_str) {
        line.push_str(&format!(" - {desc}"));
    }
    line
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn no_schema_text(server: &str, schema: &ToolSchema) -> String {
    let mut lines = vec![format!("Tool \"{server}.{}\" parameters:", schema.name)];
    if !schema.description.is_empty() {
        lines.push(format!("Description: {}", schema.description));
    }
    lines.push(
        "This tool publishes no parameter schema. Pass `arguments` as a JSON object based on the description."
            .to_string(),
    );
    lines.join("\n")
}

/// Required argument names absent from `args`.
pub fn missing_required(schema: &ToolSchema, args: &Map<String, Value>) -> Vec<String> {
    let Some(obj) = object_schema(schema) else {
        return Vec::new();
    };
    required(obj)
        .into_iter()
        .filter(|key| match args.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            _ => false,
        })
        .collect()
}

/// Smallest argument object that satisfies the schema, optionally with a few optional keys.
pub fn example_arguments(schema: &ToolSchema, include_optional: bool) -> Value {
    let mut example = Map::new();
    let Some(obj) = object_schema(schema) else {
        return Value::Object(example);
    };
    let required = required(obj);
    let props = properties(obj);
    for (name, prop) in &props {
        if required.contains(*name) {
            example.insert((*name).clone(), example_value(&primary_type(prop), prop));
        }
    }
    if include_optional {
        for (name, prop) in props
            .iter()
            .filter(|(name, _)| !required.contains(*name))
            .take(MAX_OPTIONAL_IN_EXAMPLE)
        {
            example.insert((*name).clone(), example_value(&primary_type(prop), prop));
        }
    }
    Value::Object(example)
}

pub fn diagnose(schema: &ToolSchema, args: &Map<String, Value>) -> ArgIssues {
    let mut issues = ArgIssues::default();
    let Some(obj) = object_schema(schema) else {
        return issues;
    };
    let props = obj.get("properties").and_then(Value::as_object);
    issues.missing_required = missing_required(schema, args);
    for (key, value) in args {
        let Some(prop) = props.and_then(|p| p.get(key)) else {
            issues.unknown_keys.push(key.clone());
            continue;
        };
        let expected = declared_types(prop);
        if !expected.is_empty() && !expected.iter().any(|t| type_matches(t, value)) {
            issues.type_mismatches.push((
                key.clone(),
                expected.join("|"),
                actual_type(value).to_string(),
            ));
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.is_empty() && !allowed.contains(value) {
                issues
                    .enum_violations
                    .push((key.clone(), allowed.clone(), value.clone()));
            }
        }
    }
    issues
}

/// Stage 1: a minimal example and the required-field list.
pub fn schema_hint(server: &str, schema: &ToolSchema) -> String {
    let Some(obj) = object_schema(schema) else {
        return no_schema_text(server, schema);
    };
    let required = required(obj);
    let mut lines = vec![format!("Tool \"{server}.{}\" parameters:", schema.name)];
    if !schema.description.is_empty() {
        lines.push(format!("Description: {}", schema.description));
    }
    lines.push(if required.is_empty() {
        "No required parameters.".to_string()
    } else {
        format!("Required: {}", required.join(", "))
    });
    lines.push("Example arguments:".to_string());
    lines.push(pretty(&example_arguments(schema, false)));
    lines.join("\n")
}

/// Stage 2: what is wrong with the arguments that were sent, plus a valid example.
pub fn concise_guide(server: &str, schema: &ToolSchema, args: &Map<String, Value>) -> String {
    if object_schema(schema).is_none() {
        return no_schema_text(server, schema);
    }
    let issues = diagnose(schema, args);
    let mut lines = vec![format!("Fix the arguments for \"{server}.{}\":", schema.name)];
    if issues.is_empty() {
        lines.push("No obvious argument problem was detected; check the values against the description.".to_string());
    } else {
        lines.extend(issues.lines().into_iter().map(|line| format!("- {line}")));
    }
    lines.push("Minimal valid arguments:".to_string());
    lines.push(pretty(&example_arguments(schema, false)));
    lines.join("\n")
}

/// Stage 3: the full parameter reference, a diagnosis and other tools on the same server.
pub fn detailed_guide(
    server: &str,
    schema: &ToolSchema,
    args: &Map<String, Value>,
    alternatives: &[ToolSchema],
) -> String {
    let mut lines = Vec::new();
    match object_schema(schema) {
        None => lines.push(no_schema_text(server, schema)),
        Some(obj) => {
            let required = required(obj);
            lines.push(format!("Tool \"{server}.{}\" reference:", schema.name));
            if !schema.description.is_empty() {
                lines.push(format!("Description: {}", schema.description));
            }
            lines.push("Parameters:".to_string());
            let params = properties(obj)
                .into_iter()
                .map(|(name, prop)| param_line(name, prop, required.contains(name)))
                .collect::<Vec<_>>();
            let total = params.len();
            lines.extend(params.into_iter().take(MAX_PARAM_LINES));
            if total > MAX_PARAM_LINES {
                lines.push(format!("... {} more omitted", total - MAX_PARAM_LINES));
            }
            lines.push(if required.is_empty() {
                "No required parameters.".to_string()
            } else {
                format!("Required: {}", required.join(", "))
            });
            let issues = diagnose(schema, args);
            lines.push("Diagnosis:".to_string());
            if issues.is_empty() {
                lines.push("No significant argument problem detected.".to_string());
            } else {
                lines.extend(issues.lines());
            }
            lines.push("Suggested arguments:".to_string());
            lines.push(pretty(&example_arguments(schema, true)));
        }
    }
    let others = alternatives
        .iter()
        .filter(|t| t.name != schema.name)
        .take(MAX_ALTERNATIVES)
        .collect::<Vec<_>>();
    if !others.is_empty() {
        lines.push(format!("Other tools on \"{server}\":"));
        lines.extend(others.iter().map(|t| describe_tool(t)));
    }
    lines.join("\n")
}

fn describe_tool(tool: &ToolSchema) -> String {
    if tool.description.is_empty() {
        format!("- {}", tool.name)
    } else {
        format!("- {}: {}", tool.name, tool.description)
    }
}

/// Name and description of every tool, one per line.
pub fn describe_tools(tools: &[ToolSchema]) -> String {
    tools.iter().map(describe_tool).collect::<Vec<_>>().join("\n")
}
