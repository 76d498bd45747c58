//! `qjsctl` – headless CLI harness for the QuickJS bridge.
//!
//! Drives the same method channel an embedding host would, from a terminal:
//! one-shot evals and calls, YAML scenarios, a doctor report, and a socket
//! daemon that keeps engines alive between requests.

mod logging;
mod serve;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quickjs_bridge::types::*;
use quickjs_bridge::{get_config, BridgeContext, MethodChannel};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "qjsctl",
    version,
    about = "CLI harness for the QuickJS bridge"
)]
struct Cli {
    /// Log at debug level regardless of config.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report environment facts and run engine self-checks.
    Doctor {
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
        /// Write result JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Evaluate a script in a fresh engine.
    Eval {
        /// Script source. Mutually exclusive with --file.
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        source: Option<String>,
        /// Read the script from a file.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Heap limit for the engine, in bytes.
        #[arg(long)]
        memory_limit: Option<u64>,
        /// Interrupt the script after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Evaluate as an ES module and print its exports.
        #[arg(long)]
        module: bool,
        /// Force strict mode.
        #[arg(long)]
        strict: bool,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Invoke a channel method by name with JSON arguments.
    Call {
        /// Method name (e.g. "evalScript", "callFunction").
        method: String,
        /// JSON arguments object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Run a scripted scenario from a YAML file.
    RunScenario {
        /// Path to the scenario YAML file.
        file: PathBuf,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Serve the method channel over a Unix socket.
    Serve {
        /// Path for the Unix domain socket.
        #[arg(long)]
        socket: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = get_config();
    logging::init_logging(&config.logging, cli.verbose);

    let channel = MethodChannel::new(&BridgeContext::default_quickjs());

    match cli.command {
        Commands::Doctor { json, out } => cmd_doctor(&channel, json, out),
        Commands::Eval {
            source,
            file,
            memory_limit,
            timeout_ms,
            module,
            strict,
            json,
        } => {
            let opts = EvalFlags {
                memory_limit,
                timeout_ms,
                module,
                strict,
            };
            cmd_eval(&channel, source, file, &opts, json)
        }
        Commands::Call {
            method,
            args,
            json,
            artifacts,
        } => cmd_call(&channel, &method, &args, json, artifacts),
        Commands::RunScenario {
            file,
            artifacts,
            json,
        } => cmd_run_scenario(&channel, &file, json, artifacts),
        Commands::Serve { socket } => serve::run_daemon(socket, Arc::new(channel)).await?,
    }
    Ok(())
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

fn cmd_doctor(channel: &MethodChannel, json: bool, out: Option<PathBuf>) {
    let config = serde_json::to_value(get_config()).unwrap_or_default();
    let result = quickjs_bridge::doctor::run_doctor(channel, &config);
    if let Some(ref path) = out {
        write_result_file(path, &result);
    }
    output_result(&result, json);
}

struct EvalFlags {
    memory_limit: Option<u64>,
    timeout_ms: Option<u64>,
    module: bool,
    strict: bool,
}

fn cmd_eval(
    channel: &MethodChannel,
    source: Option<String>,
    file: Option<PathBuf>,
    flags: &EvalFlags,
    json: bool,
) {
    let file_name = file.as_ref().map(|p| p.display().to_string());
    let source = match (source, file) {
        (Some(s), _) => s,
        (None, Some(path)) => match read_file(&path, "script") {
            Ok(s) => s,
            Err(e) => return output_result(&io_error("eval", e), json),
        },
        (None, None) => String::new(),
    };

    let created = channel.execute(
        "createEngine",
        json!({ "memoryLimitBytes": flags.memory_limit, "executionTimeoutMs": flags.timeout_ms }),
    );
    let Some(handle) = created.data.clone().filter(|_| created.status == Status::Pass) else {
        return output_result(&created, json);
    };

    let mut result = channel.execute(
        "evalScript",
        json!({
            "handle": handle,
            "source": source,
            "fileName": file_name,
            "module": flags.module,
            "strict": flags.strict.then_some(true),
        }),
    );
    // Drain microtasks so async console output lands before exit.
    let _ = channel.execute("executePendingJobs", json!({ "handle": handle }));
    let _ = channel.execute("disposeEngine", json!({ "handle": handle }));
    result.timing_ms.steps.insert("create_engine".into(), created.timing_ms.total);
    output_result(&result, json);
}

fn cmd_call(
    channel: &MethodChannel,
    method: &str,
    args_str: &str,
    json: bool,
    artifacts: Option<PathBuf>,
) {
    let args: serde_json::Value = match serde_json::from_str(args_str) {
        Ok(v) => v,
        Err(e) => {
            let r = result_err(
                method,
                &new_run_id(),
                0,
                ErrorInfo {
                    code: ErrorCode::InvalidArgument,
                    message: format!("invalid JSON args: {}", e),
                    details: serde_json::Value::Null,
                },
            );
            output_result(&r, json);
            return;
        }
    };

    let result = channel.execute(method, args);
    if let Some(ref dir) = artifacts {
        write_artifacts(dir, &result);
    }
    output_result(&result, json);
}

fn cmd_run_scenario(
    channel: &MethodChannel,
    file: &Path,
    json: bool,
    artifacts: Option<PathBuf>,
) {
    let yaml = match read_file(file, "scenario") {
        Ok(s) => s,
        Err(e) => return output_result(&io_error("run-scenario", e), json),
    };

    let scenario = match quickjs_bridge::scenario::load_scenario(&yaml) {
        Ok(s) => s,
        Err(e) => {
            let r = result_err(
                "run-scenario",
                &new_run_id(),
                0,
                ErrorInfo {
                    code: ErrorCode::InvalidArgument,
                    message: e,
                    details: json!({ "file": file.display().to_string() }),
                },
            );
            return output_result(&r, json);
        }
    };

    let start = Instant::now();
    let scenario_result = quickjs_bridge::scenario::run_scenario(&scenario, channel);
    tracing::info!(
        scenario = scenario_result.name.as_deref().unwrap_or("<unnamed>"),
        status = ?scenario_result.overall_status,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "scenario finished"
    );

    if json {
        let j = serde_json::to_string_pretty(&scenario_result).unwrap_or_default();
        println!("{}", j);
    } else {
        println!(
            "Scenario: {}",
            scenario_result.name.as_deref().unwrap_or("<unnamed>")
        );
        println!("Overall: {:?}", scenario_result.overall_status);
        for (i, sr) in scenario_result.step_results.iter().enumerate() {
            let code = sr
                .error
                .as_ref()
                .map(|e| format!(" {}", e.code))
                .unwrap_or_default();
            println!(
                "  Step {}: {} -> {:?}{} ({}ms)",
                i, sr.method, sr.status, code, sr.timing_ms.total
            );
        }
    }

    if let Some(ref dir) = artifacts {
        let art_dir = dir.join(new_run_id());
        let _ = std::fs::create_dir_all(&art_dir);
        let j = serde_json::to_string_pretty(&scenario_result).unwrap_or_default();
        let _ = std::fs::write(art_dir.join("result.json"), j);

        let mut lines = String::new();
        for sr in &scenario_result.step_results {
            if let Ok(line) = serde_json::to_string(sr) {
                lines.push_str(&line);
                lines.push('\n');
            }
        }
        let _ = std::fs::write(art_dir.join("events.jsonl"), lines);
    }

    match scenario_result.overall_status {
        Status::Pass | Status::Skip => {}
        Status::Fail => std::process::exit(1),
        Status::Error => std::process::exit(2),
    }
}

// ===========================================================================
// Input helpers
// ===========================================================================

fn read_file(path: &Path, what: &str) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {} file {}", what, path.display()))
}

fn io_error(method: &str, e: anyhow::Error) -> CallResult {
    result_err(
        method,
        &new_run_id(),
        0,
        ErrorInfo {
            code: ErrorCode::IoError,
            message: format!("{:#}", e),
            details: serde_json::Value::Null,
        },
    )
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn output_result(result: &CallResult, json: bool) {
    if json {
        let j = serde_json::to_string_pretty(result).unwrap_or_default();
        println!("{}", j);
    } else {
        print_human(result);
    }

    // Exit with non-zero status on error/fail
    match result.status {
        Status::Pass | Status::Skip => {}
        Status::Fail => std::process::exit(1),
        Status::Error => std::process::exit(2),
    }
}

fn print_human(r: &CallResult) {
    let status_icon = match r.status {
        Status::Pass => "PASS",
        Status::Fail => "FAIL",
        Status::Skip => "SKIP",
        Status::Error => "ERROR",
    };

    match r.handle {
        Some(h) => println!("[{}] {} (engine {})", status_icon, r.method, h),
        None => println!("[{}] {}", status_icon, r.method),
    }
    println!("  run_id: {}", r.run_id);
    println!("  timing: {}ms", r.timing_ms.total);

    for (step, ms) in &r.timing_ms.steps {
        println!("    {}: {}ms", step, ms);
    }

    if let Some(ref err) = r.error {
        println!("  error:  {} – {}", err.code, err.message);
        if !err.details.is_null() {
            println!("  details: {}", err.details);
        }
    }

    if let Some(ref data) = r.data {
        if let Ok(s) = serde_json::to_string_pretty(data) {
            for line in s.lines() {
                println!("  {}", line);
            }
        }
    }
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_result_file(path: &Path, result: &CallResult) {
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    if let Err(e) = std::fs::write(path, &j) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write result file");
    }
}

fn write_artifacts(dir: &Path, result: &CallResult) {
    let art_dir = dir.join(&result.run_id);
    if let Err(e) = std::fs::create_dir_all(&art_dir) {
        tracing::warn!(dir = %art_dir.display(), error = %e, "failed to create artifacts dir");
        return;
    }

    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    let _ = std::fs::write(art_dir.join("result.json"), &j);

    if let Ok(line) = serde_json::to_string(result) {
        let _ = std::fs::write(art_dir.join("events.jsonl"), format!("{}\n", line));
    }
}
