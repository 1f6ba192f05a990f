use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol;

/// Closed set of results for one recognition run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    NoFace,
    PynqConnection,
    CameraAccess,
    PythonDependencies,
    MissingModule,
    PythonNotFound,
    PythonError,
    Timeout,
    ProcessSpawnError,
    Unknown,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 11] = [
        OutcomeKind::Success,
        OutcomeKind::NoFace,
        OutcomeKind::PynqConnection,
        OutcomeKind::CameraAccess,
        OutcomeKind::PythonDependencies,
        OutcomeKind::MissingModule,
        OutcomeKind::PythonNotFound,
        OutcomeKind::PythonError,
        OutcomeKind::Timeout,
        OutcomeKind::ProcessSpawnError,
        OutcomeKind::Unknown,
    ];

    /// Wire code surfaced in the `error` field of failure responses.
    pub fn code(self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::NoFace => "no_face",
            OutcomeKind::PynqConnection => "pynq_connection",
            OutcomeKind::CameraAccess => "camera_access",
            OutcomeKind::PythonDependencies => "python_dependencies",
            OutcomeKind::MissingModule => "missing_module",
            OutcomeKind::PythonNotFound => "python_not_found",
            OutcomeKind::PythonError => "python_error",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::ProcessSpawnError => "process_spawn_error",
            OutcomeKind::Unknown => "unknown",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// Short end-user message for this outcome.
    pub fn message(self) -> &'static str {
        match self {
            OutcomeKind::Success => "Attendance marked successfully!",
            OutcomeKind::NoFace => {
                "No face detected in the image. Please ensure your face is clearly visible."
            }
            OutcomeKind::PynqConnection => {
                "PYNQ server is not available. Please check if the PYNQ board is running."
            }
            OutcomeKind::CameraAccess => "Camera access denied. Please check camera permissions.",
            OutcomeKind::PythonDependencies => {
                "Python dependencies not installed. Please check server configuration."
            }
            OutcomeKind::MissingModule => {
                "Missing Python module. Dependencies may not be installed correctly."
            }
            OutcomeKind::PythonNotFound => "Python command not found. Server configuration issue.",
            OutcomeKind::PythonError => "Python script execution failed.",
            OutcomeKind::Timeout => "The attendance marking process took too long.",
            OutcomeKind::ProcessSpawnError => "Failed to start the recognition process.",
            OutcomeKind::Unknown => "Error marking attendance.",
        }
    }

    pub fn is_success(self) -> bool {
        self == OutcomeKind::Success
    }

    /// Kinds only the adapter itself can produce, never the child.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, OutcomeKind::Timeout | OutcomeKind::ProcessSpawnError)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Everything the adapter observed for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when the process could not be spawned at all.
    pub spawn_error: Option<String>,
}

/// How to treat a zero exit that carries no explicit marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SuccessPolicy {
    /// Require at least one positive marker; a bare zero exit is `unknown`.
    #[default]
    Strict,
    /// Treat a bare zero exit as success.
    Lenient,
}

/// Which rule of the precedence table decided the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecidedBy {
    Lifecycle,
    StructuredLine,
    NegativeMarker,
    PositiveMarker,
    ExitCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: OutcomeKind,
    pub decided_by: DecidedBy,
    /// Zero exit with no markers at all; the result rests on policy alone.
    pub ambiguous: bool,
    /// Reason text from a structured result line, if the child printed one.
    pub reason: Option<String>,
}

/// Positive signals observed in stdout of a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessDetails {
    pub face_detected: bool,
    pub pynq_connected: bool,
    pub data_sent: bool,
    pub server_mode: bool,
    pub simulated: bool,
    pub dummy_image: bool,
    pub image_processed: bool,
}

impl SuccessDetails {
    pub fn from_stdout(stdout: &str) -> Self {
        Self {
            face_detected: !stdout.contains(NO_FACE),
            pynq_connected: stdout.contains("Connected to PYNQ"),
            data_sent: stdout.contains(STREAM_SENT),
            server_mode: stdout.contains("Server environment") || stdout.contains("SERVER"),
            simulated: stdout.contains("simulated") || stdout.contains("FALLBACK"),
            dummy_image: stdout.contains("Dummy Image") || stdout.contains("SERVER MODE"),
            image_processed: stdout.contains("Image captured and saved")
                || stdout.contains("Image saved to"),
        }
    }
}

const NO_FACE: &str = "No face found";
const CONNECTION_REFUSED: &str = "ConnectionRefusedError";
const STREAM_SENT: &str = "Stream sent to PYNQ";
const MODULE_NOT_FOUND: &str = "ModuleNotFoundError";
const NO_MODULE_NAMED: &str = "No module named";
const COMMAND_NOT_FOUND_EXIT: i32 = 127;

const CAMERA_MARKERS: [&str; 2] = ["could not open webcam", "could not open camera"];

const POSITIVE_MARKERS: [&str; 6] = [
    "SUCCESS",
    "[SUCCESS]",
    "Attendance marked successfully",
    STREAM_SENT,
    "Attendance marked (simulated)",
    "FALLBACK",
];

/// Classify one run. Pure: identical reports always yield identical results.
///
/// Precedence, highest first: lifecycle (spawn failure, timeout), structured
/// result line, negative markers, positive markers, exit code.
pub fn classify(report: &RunReport, policy: SuccessPolicy) -> Classification {
    let decide = |kind, decided_by| Classification {
        kind,
        decided_by,
        ambiguous: false,
        reason: None,
    };

    if report.spawn_error.is_some() {
        return decide(OutcomeKind::ProcessSpawnError, DecidedBy::Lifecycle);
    }
    if report.timed_out {
        return decide(OutcomeKind::Timeout, DecidedBy::Lifecycle);
    }

    if let Some(line) = protocol::terminal_status(&report.stdout) {
        return Classification {
            kind: line.kind,
            decided_by: DecidedBy::StructuredLine,
            ambiguous: false,
            reason: line.reason,
        };
    }

    if let Some(kind) = negative_marker(report) {
        return decide(kind, DecidedBy::NegativeMarker);
    }

    if POSITIVE_MARKERS.iter().any(|m| report.stdout.contains(m)) {
        return decide(OutcomeKind::Success, DecidedBy::PositiveMarker);
    }

    match report.exit_code {
        Some(0) => {
            let kind = match policy {
                SuccessPolicy::Strict => OutcomeKind::Unknown,
                SuccessPolicy::Lenient => OutcomeKind::Success,
            };
            Classification {
                kind,
                decided_by: DecidedBy::ExitCode,
                ambiguous: true,
                reason: None,
            }
        }
        // An import failure names its cause more precisely than the exit
        // code, so it is checked before 127.
        _ if report.stderr.contains(MODULE_NOT_FOUND) => {
            decide(OutcomeKind::PythonDependencies, DecidedBy::ExitCode)
        }
        _ if report.stderr.contains(NO_MODULE_NAMED) => {
            decide(OutcomeKind::MissingModule, DecidedBy::ExitCode)
        }
        Some(COMMAND_NOT_FOUND_EXIT) => decide(OutcomeKind::PythonNotFound, DecidedBy::ExitCode),
        _ => decide(OutcomeKind::PythonError, DecidedBy::ExitCode),
    }
}

fn negative_marker(report: &RunReport) -> Option<OutcomeKind> {
    if report.stdout.contains(NO_FACE) {
        return Some(OutcomeKind::NoFace);
    }
    if report.stderr.contains(CONNECTION_REFUSED) {
        return Some(OutcomeKind::PynqConnection);
    }
    let lowered = report.stdout.to_lowercase();
    if CAMERA_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(OutcomeKind::CameraAccess);
    }
    None
}
