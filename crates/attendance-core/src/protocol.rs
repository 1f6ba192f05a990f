//! Structured result line.
//!
//! A recognition script may finish by printing one JSON object on its last
//! non-empty stdout line:
//!
//! ```text
//! {"attendance_status": "no_face", "reason": "0 faces in frame"}
//! ```
//!
//! When present and valid it decides the outcome; otherwise the marker
//! heuristics in [`crate::outcome`] apply.

use serde::Deserialize;

use crate::outcome::OutcomeKind;

#[derive(Debug, Deserialize)]
struct RawStatusLine {
    attendance_status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// A parsed, accepted result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub kind: OutcomeKind,
    pub reason: Option<String>,
}

/// Parse the terminal status line from captured stdout, if there is one.
///
/// Lifecycle kinds (`timeout`, `process_spawn_error`) are rejected: only the
/// adapter observes those.
pub fn terminal_status(stdout: &str) -> Option<StatusLine> {
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    if !last.starts_with('{') {
        return None;
    }

    let raw: RawStatusLine = match serde_json::from_str(last) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "terminal stdout line looks like JSON but is not a status line");
            return None;
        }
    };

    let Some(kind) = OutcomeKind::from_code(&raw.attendance_status) else {
        tracing::warn!(status = %raw.attendance_status, "unknown attendance_status in result line");
        return None;
    };
    if kind.is_lifecycle() {
        tracing::warn!(status = %kind, "result line claimed a lifecycle outcome; ignoring");
        return None;
    }

    Some(StatusLine {
        kind,
        reason: raw.reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_last_line() {
        let out = "loading model\n{\"attendance_status\": \"success\"}\n\n";
        let line = terminal_status(out).unwrap();
        assert_eq!(line.kind, OutcomeKind::Success);
        assert_eq!(line.reason, None);
    }

    #[test]
    fn test_only_the_last_line_counts() {
        let out = "{\"attendance_status\": \"success\"}\nNo face found\n";
        assert!(terminal_status(out).is_none());
    }

    #[test]
    fn test_rejects_unknown_and_lifecycle_kinds() {
        assert!(terminal_status("{\"attendance_status\": \"great\"}").is_none());
        assert!(terminal_status("{\"attendance_status\": \"timeout\"}").is_none());
        assert!(terminal_status("{\"attendance_status\": \"process_spawn_error\"}").is_none());
    }

    #[test]
    fn test_ignores_unrelated_json() {
        assert!(terminal_status("{\"embedding\": [1, 2, 3]}").is_none());
        assert!(terminal_status("{not json").is_none());
        assert!(terminal_status("").is_none());
    }
}
