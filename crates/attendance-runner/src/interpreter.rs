//! Interpreter discovery.
//!
//! Deployment targets disagree on what the Python binary is called, so the
//! daemon probes a list of candidates once at startup and keeps the first
//! one that answers `--version`.

use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Candidate names tried in order when none are configured.
pub const DEFAULT_CANDIDATES: [&str; 4] = ["python3", "python", "python3.11", "python3.9"];

/// Deadline for a single `--version` probe or import check.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Packages the recognition script needs, checked by diagnostics.
pub const DEFAULT_REQUIRED_MODULES: [&str; 3] = ["cv2", "face_recognition", "numpy"];

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no working interpreter among candidates {candidates:?}")]
    NoneFound {
        candidates: Vec<String>,
        probes: Vec<Probe>,
    },
}

/// A resolved interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interpreter {
    pub program: String,
    pub version: String,
}

impl Interpreter {
    /// Use `program` without probing it.
    pub fn new(program: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            version: version.into(),
        }
    }
}

/// Result of probing one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Probe {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Probe {
    pub fn is_ok(&self) -> bool {
        self.version.is_some()
    }
}

/// Outcome of a successful discovery: the winner plus every probe made.
#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub interpreter: Interpreter,
    pub probes: Vec<Probe>,
}

/// Run `<candidate> --version` and report what it printed.
///
/// Python 2 prints its version on stderr, so either stream counts.
pub async fn probe(candidate: &str, timeout: Duration) -> Probe {
    let mut cmd = Command::new(candidate);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let fail = |error: String| Probe {
        candidate: candidate.to_string(),
        version: None,
        error: Some(error),
    };

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return fail(e.to_string()),
        Err(_) => return fail(format!("timed out after {}ms", timeout.as_millis())),
    };

    if !output.status.success() {
        return fail(format!("exited with {}", output.status));
    }

    let first_line = |bytes: &[u8]| {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    };

    match first_line(&output.stdout).or_else(|| first_line(&output.stderr)) {
        Some(version) => Probe {
            candidate: candidate.to_string(),
            version: Some(version),
            error: None,
        },
        None => fail("printed no version string".into()),
    }
}

/// Probe candidates in order and stop at the first that works.
pub async fn discover(candidates: &[String], timeout: Duration) -> Result<Discovery, DiscoveryError> {
    let mut probes = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let result = probe(candidate, timeout).await;
        match &result.version {
            Some(version) => {
                tracing::info!(candidate = %candidate, version = %version, "interpreter found");
                let interpreter = Interpreter::new(candidate.clone(), version.clone());
                probes.push(result);
                return Ok(Discovery {
                    interpreter,
                    probes,
                });
            }
            None => {
                tracing::debug!(
                    candidate = %candidate,
                    error = result.error.as_deref().unwrap_or(""),
                    "interpreter candidate unavailable"
                );
                probes.push(result);
            }
        }
    }

    Err(DiscoveryError::NoneFound {
        candidates: candidates.to_vec(),
        probes,
    })
}

/// Whether one package imports under the resolved interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportCheck {
    pub module: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dotted Python identifiers only; the name is spliced into `-c` code.
fn is_module_name(name: &str) -> bool {
    name.split('.').all(|part| {
        let mut chars = part.chars();
        chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Run `<program> -c "import <module>"`.
///
/// A failed import reports the last line of stderr, which for Python is the
/// exception itself (`ModuleNotFoundError: No module named 'cv2'`).
pub async fn check_import(program: &str, module: &str, timeout: Duration) -> ImportCheck {
    let fail = |error: String| ImportCheck {
        module: module.to_string(),
        available: false,
        error: Some(error),
    };

    if !is_module_name(module) {
        return fail("not a module name".into());
    }

    let mut cmd = Command::new(program);
    cmd.arg("-c")
        .arg(format!("import {module}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return fail(e.to_string()),
        Err(_) => return fail(format!("timed out after {}ms", timeout.as_millis())),
    };

    if output.status.success() {
        return ImportCheck {
            module: module.to_string(),
            available: true,
            error: None,
        };
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let last = stderr.lines().map(str::trim).rev().find(|l| !l.is_empty());
    fail(last.map_or_else(|| format!("exited with {}", output.status), str::to_string))
}

/// Check each module in turn.
pub async fn check_imports(program: &str, modules: &[String], timeout: Duration) -> Vec<ImportCheck> {
    let mut checks = Vec::with_capacity(modules.len());
    for module in modules {
        let check = check_import(program, module, timeout).await;
        if !check.available {
            tracing::warn!(
                program,
                module = %module,
                error = check.error.as_deref().unwrap_or(""),
                "required module does not import"
            );
        }
        checks.push(check);
    }
    checks
}

/// Probe every candidate without stopping early. Used for diagnostics.
pub async fn probe_all(candidates: &[String], timeout: Duration) -> Vec<Probe> {
    let mut probes = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        probes.push(probe(candidate, timeout).await);
    }
    probes
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn stub(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_discover_skips_missing_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let good = stub(dir.path(), "python-stub", "echo 'Python 3.11.4'");
        let candidates = vec!["/nonexistent/python3".to_string(), good.clone()];

        let found = discover(&candidates, PROBE_TIMEOUT).await.unwrap();
        assert_eq!(found.interpreter.program, good);
        assert_eq!(found.interpreter.version, "Python 3.11.4");
        assert_eq!(found.probes.len(), 2);
        assert!(!found.probes[0].is_ok());
    }

    #[tokio::test]
    async fn test_version_on_stderr_counts() {
        let dir = tempfile::tempdir().unwrap();
        let py2 = stub(dir.path(), "python2-stub", "echo 'Python 2.7.18' >&2");
        let probe = probe(&py2, PROBE_TIMEOUT).await;
        assert_eq!(probe.version.as_deref(), Some("Python 2.7.18"));
    }

    #[tokio::test]
    async fn test_failing_or_silent_candidates_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let failing = stub(dir.path(), "failing", "echo 'Python 3.12' ; exit 2");
        let silent = stub(dir.path(), "silent", "exit 0");
        let candidates = vec![failing, silent];

        let err = discover(&candidates, PROBE_TIMEOUT).await.unwrap_err();
        let DiscoveryError::NoneFound { probes, .. } = err;
        assert_eq!(probes.len(), 2);
        assert!(probes.iter().all(|p| p.error.is_some()));
    }

    #[tokio::test]
    async fn test_import_checks_report_each_module() {
        let dir = tempfile::tempdir().unwrap();
        let py = stub(
            dir.path(),
            "python-stub",
            r#"case "$2" in
  "import numpy") exit 0 ;;
  *) echo "Traceback (most recent call last):" >&2
     echo "ModuleNotFoundError: No module named '${2#import }'" >&2
     exit 1 ;;
esac"#,
        );
        let modules = vec!["numpy".to_string(), "cv2".to_string()];

        let checks = check_imports(&py, &modules, PROBE_TIMEOUT).await;
        assert!(checks[0].available);
        assert_eq!(checks[0].error, None);
        assert!(!checks[1].available);
        assert_eq!(
            checks[1].error.as_deref(),
            Some("ModuleNotFoundError: No module named 'cv2'")
        );
    }

    #[tokio::test]
    async fn test_import_check_rejects_code() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let py = stub(dir.path(), "python-stub", &format!("touch {}", marker.display()));

        for name in ["os; print(1)", "", "1abc", "a..b"] {
            let check = check_import(&py, name, PROBE_TIMEOUT).await;
            assert!(!check.available, "{name:?}");
        }
        assert!(!marker.exists());
        assert!(check_import(&py, "face_recognition.api", PROBE_TIMEOUT).await.available);
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let slow = stub(dir.path(), "slow", "exec sleep 10");
        let probe = probe(&slow, Duration::from_millis(200)).await;
        assert!(probe.error.unwrap().contains("timed out"));
    }
}
