use attendance_core::RunReport;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::interpreter::Interpreter;

/// Environment variable carrying the upload path to the child.
pub const IMAGE_PATH_ENV: &str = "ATTEND_IMAGE_PATH";

/// Output kept per stream. Verdict lines come last, so a chatty script
/// loses the head of its output, never the tail.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// How long to wait for a killed child to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunnerError {
    #[error("all {0} recognition slots are busy")]
    Busy(usize),
}

pub struct RunnerConfig {
    pub interpreter: Interpreter,
    /// Recognition script passed as the interpreter's first argument.
    pub script: PathBuf,
    /// Wall-clock deadline per run, counted from spawn.
    pub timeout: Duration,
    /// Value of `FORCE_SERVER_MODE` for the child.
    pub server_mode: bool,
    /// Maximum number of live recognition processes.
    pub max_concurrent: usize,
    /// How long a submission may wait for a free slot.
    pub queue_timeout: Duration,
}

/// A reserved recognition slot. Dropping it frees the slot.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

/// Owns the lifecycle of recognition processes.
pub struct Runner {
    interpreter: Interpreter,
    script: PathBuf,
    timeout: Duration,
    server_mode: bool,
    max_concurrent: usize,
    queue_timeout: Duration,
    slots: Arc<Semaphore>,
    spawned: AtomicU64,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            interpreter: config.interpreter,
            script: absolute(&config.script),
            timeout: config.timeout,
            server_mode: config.server_mode,
            max_concurrent,
            queue_timeout: config.queue_timeout,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            spawned: AtomicU64::new(0),
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of recognition processes currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    /// Number of spawn attempts since startup.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Command line shown in diagnostics, without the per-request image path.
    pub fn command_line(&self) -> String {
        format!("{} {}", self.interpreter.program, self.script.display())
    }

    /// Reserve a slot, waiting up to the queue timeout.
    pub async fn admit(&self) -> Result<Admission, RunnerError> {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        match tokio::time::timeout(self.queue_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(Admission { _permit: permit }),
            // The semaphore is never closed, so only the timeout lands here.
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    max_concurrent = self.max_concurrent,
                    waited_ms = self.queue_timeout.as_millis() as u64,
                    "no free recognition slot"
                );
                Err(RunnerError::Busy(self.max_concurrent))
            }
        }
    }

    /// Run the recognition script once against `image`.
    ///
    /// Exactly one terminal event decides the report: spawn failure, process
    /// exit, or the deadline, whichever is observed first. On deadline the
    /// child's whole process group is killed and reaped; output captured so
    /// far is still returned. Dropping the returned future kills the group
    /// as well.
    pub async fn run(&self, _slot: &Admission, image: &Path) -> RunReport {
        let image = absolute(image);
        let mut cmd = Command::new(&self.interpreter.program);
        cmd.arg(&self.script)
            .arg(&image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FORCE_SERVER_MODE", if self.server_mode { "true" } else { "false" })
            .env("PYTHONUNBUFFERED", "1")
            .env(IMAGE_PATH_ENV, &image)
            .kill_on_drop(true);
        if let Some(dir) = self.script.parent().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        self.spawned.fetch_add(1, Ordering::Relaxed);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(
                    program = %self.interpreter.program,
                    error = %e,
                    "failed to spawn recognition process"
                );
                return RunReport {
                    spawn_error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let pid = child.id();
        tracing::info!(pid, image = %image.display(), "recognition process started");
        let mut group = GroupGuard { pgid: pid };

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out = Tail::new(MAX_CAPTURE_BYTES);
        let mut err = Tail::new(MAX_CAPTURE_BYTES);
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let mut status: Option<ExitStatus> = None;
        let mut timed_out = false;
        let mut wait_failed = false;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            if (status.is_some() || wait_failed) && stdout.is_none() && stderr.is_none() {
                break;
            }
            tokio::select! {
                n = read_some(&mut stdout, &mut out_buf) => match n {
                    Ok(0) => stdout = None,
                    Ok(n) => out.push(&out_buf[..n]),
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "failed to read recognition stdout");
                        stdout = None;
                    }
                },
                n = read_some(&mut stderr, &mut err_buf) => match n {
                    Ok(0) => stderr = None,
                    Ok(n) => err.push(&err_buf[..n]),
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "failed to read recognition stderr");
                        stderr = None;
                    }
                },
                s = child.wait(), if status.is_none() && !wait_failed => match s {
                    Ok(s) => status = Some(s),
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "failed to wait on recognition process");
                        wait_failed = true;
                    }
                },
                _ = &mut deadline => {
                    // An exit observed first still decides the outcome; the
                    // deadline then only stops draining.
                    timed_out = status.is_none() && !wait_failed;
                    break;
                }
            }
        }

        if status.is_none() || stdout.is_some() || stderr.is_some() {
            terminate(&mut child, pid, status.is_none()).await;
        }
        group.disarm();

        out.trim();
        err.trim();
        for (stream, tail) in [("stdout", &out), ("stderr", &err)] {
            if tail.dropped > 0 {
                tracing::warn!(
                    pid,
                    stream,
                    dropped = tail.dropped,
                    "recognition output truncated from the front"
                );
            }
        }

        if timed_out {
            tracing::warn!(
                pid,
                timeout_ms = self.timeout.as_millis() as u64,
                "recognition process timed out and was killed"
            );
        } else {
            tracing::info!(pid, status = ?status, "recognition process finished");
        }

        let report = RunReport {
            exit_code: status.and_then(|s| s.code()),
            stdout: out.into_string(),
            stderr: err.into_string(),
            timed_out,
            spawn_error: None,
        };
        tracing::debug!(pid, stdout = %report.stdout, stderr = %report.stderr, "recognition output");
        report
    }
}

async fn read_some<R: AsyncRead + Unpin>(stream: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => std::future::pending().await,
    }
}

/// The last `limit` bytes of a stream.
struct Tail {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl Tail {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        // Let the buffer grow to twice the limit so trimming stays amortized.
        if self.buf.len() > self.limit.saturating_mul(2) {
            self.trim();
        }
    }

    fn trim(&mut self) {
        let mut excess = self.buf.len().saturating_sub(self.limit);
        if excess == 0 {
            return;
        }
        // Don't start on a UTF-8 continuation byte.
        while excess < self.buf.len() && (self.buf[excess] & 0xC0) == 0x80 {
            excess += 1;
        }
        self.buf.drain(..excess);
        self.dropped += excess;
    }

    fn into_string(mut self) -> String {
        self.trim();
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Kills the child's process group unless `run` got to clean up itself.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            tracing::info!(pgid, "recognition run abandoned, killing its process group");
            #[cfg(unix)]
            kill_group(pgid);
        }
    }
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate(child: &mut Child, pid: Option<u32>, reap: bool) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        kill_group(pid);
    }
    #[cfg(not(unix))]
    let _ = pid;

    if !reap {
        return;
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "start_kill on recognition process");
    }
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(?status, "recognition process reaped"),
        Ok(Err(e)) => tracing::warn!(error = %e, "failed to reap recognition process"),
        Err(_) => tracing::warn!("recognition process still running after SIGKILL"),
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill recognition process group"),
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn runner(dir: &Path, script_body: &str, timeout: Duration) -> Runner {
        let script = dir.join("recognize.sh");
        std::fs::write(&script, script_body).unwrap();
        Runner::new(RunnerConfig {
            interpreter: Interpreter::new("/bin/sh", "stub"),
            script,
            timeout,
            server_mode: true,
            max_concurrent: 2,
            queue_timeout: Duration::from_millis(100),
        })
    }

    fn image(dir: &Path) -> PathBuf {
        let path = dir.join("photo.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF]).unwrap();
        path
    }

    /// Zombies count as dead: an orphaned grandchild may wait on a PID 1
    /// that never reaps.
    fn is_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat.contains(") Z "),
            Err(_) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok(),
        }
    }

    async fn wait_dead(pid: i32) -> bool {
        for _ in 0..50 {
            if !is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_captures_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(
            dir.path(),
            "echo 'SUCCESS: Attendance marked'\necho 'warn' >&2\nexit 3\n",
            Duration::from_secs(5),
        );
        let slot = r.admit().await.unwrap();
        let report = r.run(&slot, &image(dir.path())).await;

        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.stdout.trim(), "SUCCESS: Attendance marked");
        assert_eq!(report.stderr.trim(), "warn");
        assert!(!report.timed_out);
        assert!(report.spawn_error.is_none());
        assert_eq!(r.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_child_sees_image_path_and_server_mode() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(
            dir.path(),
            "echo \"$1|$ATTEND_IMAGE_PATH|$FORCE_SERVER_MODE|$PYTHONUNBUFFERED\"\n",
            Duration::from_secs(5),
        );
        let img = image(dir.path());
        let slot = r.admit().await.unwrap();
        let report = r.run(&slot, &img).await;

        let expected = format!("{0}|{0}|true|1", img.display());
        assert_eq!(report.stdout.trim(), expected);
    }

    #[tokio::test]
    async fn test_timeout_kills_child_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let body = format!("echo partial\necho $$ > {}\nexec sleep 30\n", pid_file.display());
        let r = runner(dir.path(), &body, Duration::from_millis(500));

        let started = Instant::now();
        let slot = r.admit().await.unwrap();
        let report = r.run(&slot, &image(dir.path())).await;

        assert!(report.timed_out);
        assert_eq!(report.exit_code, None);
        assert_eq!(report.stdout.trim(), "partial");
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(wait_dead(pid).await, "recognition process {pid} leaked");
    }

    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let body = format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display());
        let r = runner(dir.path(), &body, Duration::from_millis(500));

        let slot = r.admit().await.unwrap();
        let report = r.run(&slot, &image(dir.path())).await;
        assert!(report.timed_out);

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(wait_dead(pid).await, "grandchild {pid} leaked");
    }

    #[tokio::test]
    async fn test_abandoned_run_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let body = format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display());
        let r = runner(dir.path(), &body, Duration::from_secs(30));

        let slot = r.admit().await.unwrap();
        let img = image(dir.path());
        let abandoned = tokio::time::timeout(Duration::from_millis(500), r.run(&slot, &img)).await;
        assert!(abandoned.is_err(), "run should still be in flight");

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(wait_dead(pid).await, "grandchild {pid} outlived the dropped run");
    }

    #[tokio::test]
    async fn test_long_output_keeps_the_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(
            dir.path(),
            "head -c 1200000 /dev/zero | tr '\\0' x\necho\necho 'SUCCESS: Attendance marked'\n",
            Duration::from_secs(10),
        );
        let slot = r.admit().await.unwrap();
        let report = r.run(&slot, &image(dir.path())).await;

        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.stdout.len(), MAX_CAPTURE_BYTES);
        assert!(report.stdout.trim_end().ends_with("SUCCESS: Attendance marked"));
        assert_eq!(
            attendance_core::classify(&report, attendance_core::SuccessPolicy::Strict).kind,
            attendance_core::OutcomeKind::Success
        );
    }

    #[test]
    fn test_tail_keeps_last_bytes() {
        let mut tail = Tail::new(4);
        for chunk in [b"abc".as_slice(), b"defg", b"hij"] {
            tail.push(chunk);
        }
        assert_eq!(tail.into_string(), "ghij");

        let mut tail = Tail::new(3);
        tail.push("aé€".as_bytes());
        assert_eq!(tail.into_string(), "€");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runner::new(RunnerConfig {
            interpreter: Interpreter::new("/nonexistent/python3", "none"),
            script: dir.path().join("recognize.py"),
            timeout: Duration::from_secs(5),
            server_mode: false,
            max_concurrent: 1,
            queue_timeout: Duration::from_millis(100),
        });
        let slot = r.admit().await.unwrap();
        let report = r.run(&slot, &image(dir.path())).await;

        assert!(report.spawn_error.is_some());
        assert!(!report.timed_out);
        assert_eq!(report.exit_code, None);
    }

    #[tokio::test]
    async fn test_admission_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path(), "exit 0\n", Duration::from_secs(5));

        let a = r.admit().await.unwrap();
        let b = r.admit().await.unwrap();
        assert_eq!(r.in_flight(), 2);
        assert_eq!(r.admit().await.err(), Some(RunnerError::Busy(2)));

        drop(a);
        let _c = r.admit().await.unwrap();
        drop(b);
        assert_eq!(r.in_flight(), 1);
    }
}
