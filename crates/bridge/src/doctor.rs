//! Doctor – gather environment facts and run bridge self-checks.

use crate::channel::MethodChannel;
use crate::dispatcher::DispatchError;
use crate::types::*;
use crate::value::{EngineValue, FunctionRef};
use std::collections::HashMap;
use std::time::Instant;

/// Run the doctor check and return a full report as a CallResult.
pub fn run_doctor(channel: &MethodChannel, config: &serde_json::Value) -> CallResult {
    let run_id = new_run_id();
    let start = Instant::now();

    let checks = self_check(channel);
    let failed = checks.iter().any(|c| c.status != Status::Pass);
    let steps: HashMap<String, u64> = checks
        .iter()
        .map(|c| (c.name.clone(), c.duration_ms))
        .collect();

    let report = DoctorReport {
        os_name: current_os().to_string(),
        os_version: os_version(),
        arch: std::env::consts::ARCH.to_string(),
        bridge_version: env!("CARGO_PKG_VERSION").to_string(),
        engine_backend: channel.dispatcher().factory_name().to_string(),
        channel_name: channel.name().to_string(),
        operations: channel
            .dispatcher()
            .operations()
            .into_iter()
            .map(String::from)
            .collect(),
        config: config.clone(),
        checks,
    };

    let mut r = result_ok("doctor", &run_id, start.elapsed().as_millis() as u64);
    if failed {
        r.status = Status::Fail;
    }
    r.timing_ms.steps = steps;
    r.data = Some(serde_json::to_value(&report).unwrap_or_default());
    r
}

fn self_check(channel: &MethodChannel) -> Vec<DoctorCheck> {
    let d = channel.dispatcher();
    let mut checks = Vec::new();

    let t0 = Instant::now();
    let created = d.create_engine(None);
    checks.push(check("create_engine", t0, created.as_ref().map(|_| ()).map_err(Clone::clone)));
    let Ok(handle) = created else {
        return checks;
    };

    let t1 = Instant::now();
    let eval = d.eval_script(Some(handle), "1 + 1").and_then(|v| expect(v, EngineValue::Int(2)));
    checks.push(check("eval_script", t1, eval));

    let t2 = Instant::now();
    let call = d
        .call_function(
            Some(handle),
            FunctionRef::Global("Math.max".into()),
            vec![EngineValue::Int(3), EngineValue::Int(7)],
        )
        .and_then(|v| expect(v, EngineValue::Int(7)));
    checks.push(check("call_function", t2, call));

    let t3 = Instant::now();
    checks.push(check("dispose_engine", t3, d.dispose_engine(handle)));

    let t4 = Instant::now();
    let stale = match d.eval_script(Some(handle), "1") {
        Err(DispatchError::InvalidHandle(_)) => Ok(()),
        Err(e) => Err(e),
        Ok(v) => Err(DispatchError::Internal(format!(
            "disposed handle still answered with {}",
            v
        ))),
    };
    checks.push(check("stale_handle_rejected", t4, stale));

    checks
}

fn expect(actual: EngineValue, expected: EngineValue) -> Result<(), DispatchError> {
    if actual == expected {
        Ok(())
    } else {
        Err(DispatchError::Internal(format!(
            "expected {}, got {}",
            expected, actual
        )))
    }
}

fn check(name: &str, started: Instant, outcome: Result<(), DispatchError>) -> DoctorCheck {
    let (status, message) = match outcome {
        Ok(()) => (Status::Pass, None),
        Err(e) => (Status::Fail, Some(e.to_string())),
    };
    DoctorCheck {
        name: name.to_string(),
        status,
        duration_ms: started.elapsed().as_millis() as u64,
        message,
    }
}

fn os_version() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
            for line in content.lines() {
                if let Some(ver) = line.strip_prefix("PRETTY_NAME=") {
                    return ver.trim_matches('"').to_string();
                }
            }
        }
        "unknown".to_string()
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown".into())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::context::BridgeContext;
    use crate::testing::ScriptedFactory;
    use std::sync::Arc;

    #[test]
    fn test_doctor_passes_on_quickjs() {
        let config = BridgeConfig::default();
        let channel = MethodChannel::new(&BridgeContext::quickjs_with_config(config.clone()));
        let r = run_doctor(&channel, &serde_json::to_value(&config).unwrap());
        assert_eq!(r.status, Status::Pass, "{:?}", r.data);

        let data = r.data.unwrap();
        assert_eq!(data["engine_backend"], "quickjs");
        assert_eq!(data["channel_name"], "dart_quickjs");
        assert_eq!(data["operations"].as_array().unwrap().len(), 8);
        assert_eq!(data["checks"].as_array().unwrap().len(), 5);
        assert!(r.timing_ms.steps.contains_key("stale_handle_rejected"));
        assert_eq!(channel.dispatcher().engine_count(), 0);
    }

    #[test]
    fn test_doctor_reports_failed_creation() {
        let factory = ScriptedFactory {
            fail_create: true,
            ..Default::default()
        };
        let channel = MethodChannel::new(&BridgeContext::new(
            Arc::new(factory),
            BridgeConfig::default(),
        ));
        let r = run_doctor(&channel, &serde_json::Value::Null);
        assert_eq!(r.status, Status::Fail);
        let checks = r.data.unwrap()["checks"].as_array().unwrap().clone();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0]["status"], "fail");
    }
}
