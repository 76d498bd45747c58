//! Scenario runner – execute scripted channel flows from YAML files.

use crate::channel::MethodChannel;
use crate::types::*;
use serde_json::{Map, Value};

/// Load a scenario from a YAML string.
pub fn load_scenario(yaml: &str) -> Result<Scenario, String> {
    serde_yaml::from_str(yaml).map_err(|e| format!("failed to parse scenario YAML: {}", e))
}

/// Execute a scenario and return the overall result.
pub fn run_scenario(scenario: &Scenario, channel: &MethodChannel) -> ScenarioResult {
    let mut step_results = Vec::new();
    let mut overall = Status::Pass;
    let mut saved = Map::new();

    for (i, step) in scenario.steps.iter().enumerate() {
        let args = substitute(&step.args, &saved);
        let r = channel.execute(&step.call, args);

        if r.status != step.expect_status {
            tracing::warn!(
                step = i,
                call = %step.call,
                expected = ?step.expect_status,
                actual = ?r.status,
                error = ?r.error.as_ref().map(|e| &e.message),
                "scenario step status mismatch"
            );
            overall = Status::Fail;
        }
        if let Some(code) = step.expect_code {
            let actual = r.error.as_ref().map(|e| e.code);
            if actual != Some(code) {
                tracing::warn!(step = i, expected = %code, actual = ?actual, "scenario step error code mismatch");
                overall = Status::Fail;
            }
        }
        if let Some(expected) = &step.expect_value {
            let actual = r.data.as_ref().unwrap_or(&Value::Null);
            if actual != expected {
                tracing::warn!(step = i, expected = %expected, actual = %actual, "scenario step value mismatch");
                overall = Status::Fail;
            }
        }
        if let (Some(name), Some(data)) = (&step.save_as, &r.data) {
            saved.insert(name.clone(), data.clone());
        }

        step_results.push(r);
    }

    ScenarioResult {
        name: scenario.name.clone(),
        overall_status: overall,
        step_results,
    }
}

/// Replace `"$name"` strings with values saved by earlier steps. Unknown
/// names are left as-is.
pub fn substitute(value: &Value, saved: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => s
            .strip_prefix('$')
            .and_then(|key| saved.get(key))
            .cloned()
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, saved)).collect()),
        Value::Object(m) => Value::Object(
            m.iter()
                .map(|(k, v)| (k.clone(), substitute(v, saved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::context::BridgeContext;
    use serde_json::json;

    fn channel() -> MethodChannel {
        MethodChannel::new(&BridgeContext::quickjs_with_config(BridgeConfig::default()))
    }

    #[test]
    fn test_parse_scenario() {
        let yaml = r#"
name: basic test
steps:
  - call: "createEngine"
    save_as: h
  - call: "evalScript"
    args:
      handle: "$h"
      source: "1 + 1"
    expect_value: 2
  - call: "evalScript"
    args: { handle: 999, source: "1" }
    expect_status: error
    expect_code: INVALID_HANDLE
"#;
        let s = load_scenario(yaml).expect("should parse");
        assert_eq!(s.name, Some("basic test".into()));
        assert_eq!(s.steps.len(), 3);
        assert_eq!(s.steps[0].expect_status, Status::Pass);
        assert_eq!(s.steps[2].expect_code, Some(ErrorCode::InvalidHandle));
    }

    #[test]
    fn test_parse_scenario_rejects_bad_status() {
        let yaml = r#"
steps:
  - call: "evalScript"
    expect_status: "sometimes"
"#;
        assert!(load_scenario(yaml).is_err());
    }

    #[test]
    fn test_run_lifecycle_scenario() {
        let yaml = r#"
name: lifecycle
steps:
  - call: createEngine
    save_as: h
  - call: evalScript
    args: { handle: "$h", source: "globalThis.x = 5; x * 2" }
    expect_value: 10
  - call: disposeEngine
    args: { handle: "$h" }
  - call: evalScript
    args: { handle: "$h", source: "x" }
    expect_status: error
    expect_code: INVALID_HANDLE
"#;
        let scenario = load_scenario(yaml).unwrap();
        let result = run_scenario(&scenario, &channel());
        assert_eq!(result.overall_status, Status::Pass);
        assert_eq!(result.step_results.len(), 4);
        assert_eq!(result.step_results[1].data, Some(json!(10)));
    }

    #[test]
    fn test_bundled_scenario_passes() {
        let scenario = load_scenario(include_str!("../../../scenarios/basic.yaml")).unwrap();
        let result = run_scenario(&scenario, &channel());
        assert_eq!(result.overall_status, Status::Pass, "{:#?}", result.step_results);
    }

    #[test]
    fn test_mismatch_fails_scenario() {
        let yaml = r#"
steps:
  - call: evalScript
    args: { source: "1 + 1" }
    expect_value: 3
"#;
        let scenario = load_scenario(yaml).unwrap();
        let result = run_scenario(&scenario, &channel());
        assert_eq!(result.overall_status, Status::Fail);
        // The step itself still ran fine.
        assert_eq!(result.step_results[0].status, Status::Pass);
    }

    #[test]
    fn test_unexpected_error_fails_scenario() {
        let yaml = r#"
steps:
  - call: evalScript
    args: { source: "throw new Error('x')" }
"#;
        let scenario = load_scenario(yaml).unwrap();
        let result = run_scenario(&scenario, &channel());
        assert_eq!(result.overall_status, Status::Fail);
        assert_eq!(
            result.step_results[0].error.as_ref().map(|e| e.code),
            Some(ErrorCode::EngineException)
        );
    }

    #[test]
    fn test_substitute() {
        let mut saved = Map::new();
        saved.insert("h".into(), json!(3));
        let v = substitute(&json!({ "handle": "$h", "args": ["$h", "$missing", "h"] }), &saved);
        assert_eq!(v, json!({ "handle": 3, "args": [3, "$missing", "h"] }));
    }
}
