use anyhow::{bail, Context, Result};
use attendance_core::{
    classify, validate_upload, Classification, RunReport, SuccessDetails, SuccessPolicy,
    MAX_UPLOAD_BYTES,
};
use attendance_runner::interpreter::{self, DEFAULT_CANDIDATES, PROBE_TIMEOUT};
use attendance_runner::{Interpreter, Runner, RunnerConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "attendance", about = "Attendance relay diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every interpreter candidate and report its version
    Probe {
        /// Candidates to try, in order (default: python3, python, python3.11, python3.9)
        #[arg(short, long, value_delimiter = ',')]
        candidates: Vec<String>,
        /// Also check that these packages import under the first working interpreter
        #[arg(short, long, value_delimiter = ',')]
        modules: Vec<String>,
    },
    /// Run the recognition script once against an image, bypassing the daemon
    Run {
        /// JPG or PNG image to submit
        image: PathBuf,
        /// Recognition script
        #[arg(short, long, default_value = "recognize.py")]
        script: PathBuf,
        /// Interpreter to use instead of probing for one
        #[arg(long)]
        python: Option<String>,
        /// Wall-clock deadline in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Treat a zero exit without markers as success
        #[arg(long)]
        lenient: bool,
        /// Print the full response envelope as JSON
        #[arg(long)]
        json: bool,
    },
    /// Classify previously captured output without running anything
    Classify {
        #[arg(long)]
        exit_code: Option<i32>,
        #[arg(long)]
        stdout_file: Option<PathBuf>,
        #[arg(long)]
        stderr_file: Option<PathBuf>,
        #[arg(long)]
        timed_out: bool,
        #[arg(long)]
        lenient: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Probe { candidates, modules } => {
            let candidates = candidates_or_default(candidates);
            let probes = interpreter::probe_all(&candidates, PROBE_TIMEOUT).await;
            for p in &probes {
                match (&p.version, &p.error) {
                    (Some(v), _) => println!("ok    {:<12} {v}", p.candidate),
                    (None, e) => println!("fail  {:<12} {}", p.candidate, e.as_deref().unwrap_or("")),
                }
            }
            let Some(winner) = probes.iter().find(|p| p.is_ok()) else {
                bail!("no usable interpreter");
            };

            if !modules.is_empty() {
                println!("imports under {}:", winner.candidate);
                let checks = interpreter::check_imports(&winner.candidate, &modules, PROBE_TIMEOUT).await;
                for c in &checks {
                    match &c.error {
                        None => println!("ok    {}", c.module),
                        Some(e) => println!("fail  {:<18} {e}", c.module),
                    }
                }
                if checks.iter().any(|c| !c.available) {
                    bail!("some required modules do not import");
                }
            }
        }
        Commands::Run {
            image,
            script,
            python,
            timeout_secs,
            lenient,
            json,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let file_name = image.file_name().and_then(|n| n.to_str());
            validate_upload(file_name, content_type_for(&image), &bytes, MAX_UPLOAD_BYTES)
                .with_context(|| format!("{} is not an acceptable upload", image.display()))?;

            let interpreter = match python {
                Some(program) => Interpreter::new(program, "unprobed"),
                None => {
                    let candidates = candidates_or_default(Vec::new());
                    interpreter::discover(&candidates, PROBE_TIMEOUT).await?.interpreter
                }
            };

            let runner = Runner::new(RunnerConfig {
                interpreter,
                script,
                timeout: Duration::from_secs(timeout_secs),
                server_mode: false,
                max_concurrent: 1,
                queue_timeout: Duration::from_secs(1),
            });
            println!("running: {} {}", runner.command_line(), image.display());

            let slot = runner.admit().await?;
            let report = runner.run(&slot, &image).await;
            let classification = classify(&report, policy(lenient));
            print_result(&report, &classification, json)?;
        }
        Commands::Classify {
            exit_code,
            stdout_file,
            stderr_file,
            timed_out,
            lenient,
        } => {
            let report = RunReport {
                exit_code,
                stdout: read_optional(stdout_file.as_deref())?,
                stderr: read_optional(stderr_file.as_deref())?,
                timed_out,
                spawn_error: None,
            };
            let classification = classify(&report, policy(lenient));
            print_result(&report, &classification, false)?;
        }
    }

    Ok(())
}

fn candidates_or_default(candidates: Vec<String>) -> Vec<String> {
    if candidates.is_empty() {
        DEFAULT_CANDIDATES.iter().map(|s| s.to_string()).collect()
    } else {
        candidates
    }
}

fn policy(lenient: bool) -> SuccessPolicy {
    if lenient {
        SuccessPolicy::Lenient
    } else {
        SuccessPolicy::Strict
    }
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

fn read_optional(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())),
        None => Ok(String::new()),
    }
}

fn print_result(report: &RunReport, c: &Classification, json: bool) -> Result<()> {
    if json {
        let body = if c.kind.is_success() {
            serde_json::json!({
                "success": true,
                "message": c.kind.message(),
                "output": report.stdout,
                "details": SuccessDetails::from_stdout(&report.stdout),
            })
        } else {
            serde_json::json!({
                "success": false,
                "message": c.kind.message(),
                "error": c.kind.code(),
                "debug": {
                    "exitCode": report.exit_code,
                    "output": report.stdout,
                    "error": report.spawn_error.as_deref().unwrap_or(&report.stderr),
                    "timedOut": report.timed_out,
                },
            })
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("outcome:    {}", c.kind);
    println!("decided by: {:?}", c.decided_by);
    if c.ambiguous {
        println!("note:       zero exit without markers; result depends on --lenient");
    }
    if let Some(reason) = &c.reason {
        println!("reason:     {reason}");
    }
    println!("exit code:  {:?}", report.exit_code);
    println!("message:    {}", c.kind.message());
    Ok(())
}
