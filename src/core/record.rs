use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Total coercion: known aliases map to their level, anything else is `info`.
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Severity::Info,
            "low" => Severity::Low,
            "medium" | "med" => Severity::Medium,
            "high" => Severity::High,
            "critical" | "crit" => Severity::Critical,
            _ => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Asset,
    Finding,
    #[default]
    Note,
}

impl RecordKind {
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asset" => RecordKind::Asset,
            "finding" => RecordKind::Finding,
            _ => RecordKind::Note,
        }
    }
}

/// One line of the run log. Envelope fields are typed; `data` and any
/// unknown top-level keys stay open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub tool: String,
    pub stage: String,
    pub target: String,
    pub ts: String,
    pub timestamp: String,
    pub severity: Severity,
    pub evidence: Vec<String>,
    pub data: Map<String, Value>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Values used for fields a skill left out.
#[derive(Debug, Clone, Default)]
pub struct RecordDefaults {
    pub tool: Option<String>,
    pub stage: Option<String>,
    pub target: Option<String>,
    pub source: Option<String>,
    pub workspace: Option<String>,
}

impl RecordDefaults {
    pub fn for_cell(tool: &str, stage: &str, target: &str, workspace: Option<&str>) -> Self {
        Self {
            tool: Some(tool.to_string()),
            stage: Some(stage.to_string()),
            target: Some(target.to_string()),
            source: None,
            workspace: workspace.map(str::to_string),
        }
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Coerce an arbitrary emitted value into a schema-complete [`Record`].
pub fn normalize(raw: Value, defaults: &RecordDefaults) -> Record {
    let mut obj = match raw {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), wrap_value(other));
            map
        }
    };

    let kind = take_string(&mut obj, "type")
        .map(|s| RecordKind::coerce(&s))
        .unwrap_or_default();
    let tool = take_string(&mut obj, "tool")
        .or_else(|| defaults.tool.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let stage = take_string(&mut obj, "stage")
        .or_else(|| defaults.stage.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let target = take_string(&mut obj, "target")
        .or_else(|| defaults.target.clone())
        .unwrap_or_default();

    let (ts, timestamp) = match (take_string(&mut obj, "ts"), take_string(&mut obj, "timestamp")) {
        (Some(ts), Some(timestamp)) => (ts, timestamp),
        (Some(ts), None) => (ts.clone(), ts),
        (None, Some(timestamp)) => (timestamp.clone(), timestamp),
        (None, None) => {
            let now = now_iso();
            (now.clone(), now)
        }
    };

    let severity = match obj.remove("severity") {
        Some(Value::String(s)) => Severity::coerce(&s),
        _ => Severity::Info,
    };
    let evidence = obj.remove("evidence").map(evidence_list).unwrap_or_default();
    let data = match obj.remove("data") {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(Value::String(s)) if s.is_empty() => Map::new(),
        Some(other) => match wrap_value(other) {
            Value::Object(map) => map,
            _ => Map::new(),
        },
    };
    let source = take_string(&mut obj, "source")
        .or_else(|| defaults.source.clone())
        .unwrap_or_else(|| tool.clone());
    let workspace = take_string(&mut obj, "workspace").or_else(|| defaults.workspace.clone());

    Record {
        kind,
        tool,
        stage,
        target,
        ts,
        timestamp,
        severity,
        evidence,
        data,
        source,
        workspace,
        extra: obj,
    }
}

/// Runner-authored note (timeouts, gates, scope rejections, failures).
pub fn synthetic_note(
    tool: &str,
    severity: Severity,
    message: impl Into<String>,
    data: Map<String, Value>,
    defaults: &RecordDefaults,
) -> Record {
    let mut record = normalize(Value::Null, defaults);
    record.kind = RecordKind::Note;
    record.tool = tool.to_string();
    record.source = "skillcrawler".to_string();
    record.severity = severity;
    record.evidence = vec![message.into()];
    record.data = data;
    record
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.remove(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn evidence_list(value: Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .into_iter()
            .filter(|item| !item.is_null())
            .map(evidence_item)
            .collect(),
        other => vec![evidence_item(other)],
    }
}

fn evidence_item(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn wrap_value(value: Value) -> Value {
    let mut map = Map::new();
    map.insert("value".to_string(), value);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    fn cell_defaults() -> RecordDefaults {
        RecordDefaults::for_cell("dns-recon", "recon", "example.com", Some("acme"))
    }

    #[test]
    fn test_empty_object_gets_builtin_fallbacks() {
        let record = normalize(json!({}), &RecordDefaults::default());
        assert_eq!(record.kind, RecordKind::Note);
        assert_eq!(record.tool, "unknown");
        assert_eq!(record.stage, "unknown");
        assert_eq!(record.target, "");
        assert_eq!(record.severity, Severity::Info);
        assert!(record.evidence.is_empty());
        assert!(record.data.is_empty());
        assert_eq!(record.source, "unknown");
        assert_eq!(record.ts, record.timestamp);
        assert!(record.ts.ends_with('Z'));
    }

    #[test]
    fn test_defaults_fill_missing_fields_only() {
        let record = normalize(
            json!({"type": "asset", "target": "api.example.com", "tool": ""}),
            &cell_defaults(),
        );
        assert_eq!(record.kind, RecordKind::Asset);
        assert_eq!(record.target, "api.example.com");
        assert_eq!(record.tool, "dns-recon");
        assert_eq!(record.stage, "recon");
        assert_eq!(record.workspace.as_deref(), Some("acme"));
        assert_eq!(record.source, "dns-recon");
    }

    #[rstest]
    #[case("info", Severity::Info)]
    #[case("LOW", Severity::Low)]
    #[case("med", Severity::Medium)]
    #[case("medium", Severity::Medium)]
    #[case("High", Severity::High)]
    #[case("crit", Severity::Critical)]
    #[case("critical", Severity::Critical)]
    #[case("severe", Severity::Info)]
    #[case("", Severity::Info)]
    fn test_severity_coercion(#[case] raw: &str, #[case] expected: Severity) {
        assert_eq!(Severity::coerce(raw), expected);
    }

    #[test]
    fn test_non_string_severity_is_info() {
        let record = normalize(json!({"severity": 9}), &RecordDefaults::default());
        assert_eq!(record.severity, Severity::Info);
    }

    #[rstest]
    #[case(json!("single"), vec!["single"])]
    #[case(json!(["a", "b"]), vec!["a", "b"])]
    #[case(json!([1, null, {"k": "v"}]), vec!["1", "{\"k\":\"v\"}"])]
    #[case(json!(null), vec![])]
    fn test_evidence_is_always_a_list(#[case] evidence: Value, #[case] expected: Vec<&str>) {
        let record = normalize(json!({"evidence": evidence}), &RecordDefaults::default());
        assert_eq!(record.evidence, expected);
    }

    #[test]
    fn test_timestamp_mirrors_ts() {
        let record = normalize(json!({"ts": "2024-01-01T00:00:00Z"}), &RecordDefaults::default());
        assert_eq!(record.timestamp, "2024-01-01T00:00:00Z");

        let record = normalize(json!({"timestamp": "2024-02-02T00:00:00Z"}), &RecordDefaults::default());
        assert_eq!(record.ts, "2024-02-02T00:00:00Z");

        let record = normalize(
            json!({"ts": "2024-01-01T00:00:00Z", "timestamp": "2024-01-01T00:00:05Z"}),
            &RecordDefaults::default(),
        );
        assert_ne!(record.ts, record.timestamp);
    }

    #[test]
    fn test_unknown_fields_survive_serialization() {
        let record = normalize(
            json!({"type": "finding", "cvss": 9.8, "data": {"port": 443}}),
            &cell_defaults(),
        );
        assert_eq!(record.extra.get("cvss"), Some(&json!(9.8)));

        let line = serde_json::to_string(&record).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["cvss"], json!(9.8));
        assert_eq!(value["type"], json!("finding"));
        assert_eq!(value["data"]["port"], json!(443));
    }

    #[test]
    fn test_unknown_type_and_scalar_payloads() {
        let record = normalize(json!({"type": "banner", "data": "raw text"}), &RecordDefaults::default());
        assert_eq!(record.kind, RecordKind::Note);
        assert_eq!(record.data.get("value"), Some(&json!("raw text")));

        let record = normalize(json!(42), &RecordDefaults::default());
        assert_eq!(record.data.get("value"), Some(&json!(42)));
    }

    #[test]
    fn test_synthetic_note() {
        let record = synthetic_note(
            "runner-timeout",
            Severity::Low,
            "timed out after 5s",
            Map::new(),
            &cell_defaults(),
        );
        assert_eq!(record.kind, RecordKind::Note);
        assert_eq!(record.tool, "runner-timeout");
        assert_eq!(record.target, "example.com");
        assert_eq!(record.evidence, vec!["timed out after 5s"]);
    }

    proptest! {
        #[test]
        fn prop_severity_coercion_is_idempotent(raw in ".*") {
            let once = Severity::coerce(&raw);
            prop_assert_eq!(Severity::coerce(once.as_str()), once);
        }
    }
}
