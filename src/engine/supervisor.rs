//! Lifecycle of the spawned job: start, stream output, terminate, reap.

use crate::error::ProcessError;
use crate::model::OutputStream;
use std::path::Path;
use std::process::Stdio;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// How the job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    NormalExit(i32),
    /// Ended after [`ProcessTerminator::terminate`] was called.
    TerminatedBySupervisor,
    /// Killed by a signal nobody here sent.
    TerminatedExternally { signal: Option<i32> },
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self == ExitStatus::NormalExit(0)
    }
}

/// One line of job output, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Incremental output of one child. Ends once both pipes close.
pub struct OutputLines {
    rx: mpsc::UnboundedReceiver<OutputLine>,
}

impl OutputLines {
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
struct TerminatorState {
    pid: Option<u32>,
    requested: AtomicBool,
    kill_requested: AtomicBool,
    exited: AtomicBool,
    signals_sent: AtomicU32,
    wake: Notify,
}

/// Cloneable stop handle for a running job.
///
/// Requests are handed to the reaper task, the only owner of the child, so a
/// signal is never sent to a pid that has already been reaped.
#[derive(Debug, Clone)]
pub struct ProcessTerminator {
    inner: Arc<TerminatorState>,
}

impl ProcessTerminator {
    fn new(pid: Option<u32>) -> Self {
        Self {
            inner: Arc::new(TerminatorState {
                pid,
                requested: AtomicBool::new(false),
                kill_requested: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                signals_sent: AtomicU32::new(0),
                wake: Notify::new(),
            }),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        if self.has_exited() {
            None
        } else {
            self.inner.pid
        }
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    pub fn was_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Number of stop signals actually delivered.
    pub fn signals_sent(&self) -> u32 {
        self.inner.signals_sent.load(Ordering::SeqCst)
    }

    /// Ask the job to stop (SIGTERM on unix). Returns `true` only for the call
    /// that made the request; later calls and calls after exit are no-ops.
    pub fn terminate(&self) -> bool {
        if self.has_exited() {
            tracing::debug!(pid = ?self.inner.pid, "terminate ignored: already exited");
            return false;
        }
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!(pid = ?self.inner.pid, "termination requested");
        self.inner.wake.notify_one();
        true
    }

    /// Kill the job outright. Counts as a stop request.
    pub fn kill(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        self.inner.requested.store(true, Ordering::SeqCst);
        if self.inner.kill_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::warn!(pid = ?self.inner.pid, "kill requested");
        self.inner.wake.notify_one();
        true
    }

    fn mark_exited(&self) {
        self.inner.exited.store(true, Ordering::SeqCst);
    }
}

/// The running job. The child is reaped in the background even if this
/// handle is dropped.
pub struct ProcessHandle {
    reaper: JoinHandle<std::io::Result<std::process::ExitStatus>>,
    terminator: ProcessTerminator,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.terminator.pid()
    }

    pub fn terminator(&self) -> ProcessTerminator {
        self.terminator.clone()
    }

    pub fn terminate(&self) -> bool {
        self.terminator.terminate()
    }

    /// Wait until the child exits and classify how it ended.
    pub async fn wait(self) -> Result<ExitStatus, ProcessError> {
        let joined = self.reaper.await;
        self.terminator.mark_exited();
        let status = joined
            .map_err(|e| ProcessError::Wait(std::io::Error::other(e)))?
            .map_err(ProcessError::Wait)?;
        let exit = classify(status, self.terminator.was_requested());
        tracing::info!(pid = ?self.terminator.inner.pid, status = ?exit, "job exited");
        Ok(exit)
    }
}

/// Own the child until it exits, delivering stop requests as they arrive.
async fn reap(
    mut child: Child,
    terminator: ProcessTerminator,
) -> std::io::Result<std::process::ExitStatus> {
    let state = Arc::clone(&terminator.inner);
    let mut term_sent = false;
    let mut kill_sent = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = state.wake.notified() => {
                if state.kill_requested.load(Ordering::SeqCst) && !kill_sent {
                    kill_sent = true;
                    match child.start_kill() {
                        Ok(()) => {
                            state.signals_sent.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to kill job"),
                    }
                } else if state.requested.load(Ordering::SeqCst) && !term_sent {
                    term_sent = true;
                    if send_term(&mut child) {
                        state.signals_sent.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
    };
    terminator.mark_exited();
    status
}

#[cfg(unix)]
fn send_term(child: &mut Child) -> bool {
    // `id()` is None once the child has been reaped.
    let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    // SAFETY: plain kill(2). Only this task waits on the child and it has not
    // reaped it, so `pid` still names our child (possibly a zombie).
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!(pid, error = %err, "failed to signal job");
        return false;
    }
    true
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) -> bool {
    match child.start_kill() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "failed to stop job");
            false
        }
    }
}

fn classify(status: std::process::ExitStatus, terminate_requested: bool) -> ExitStatus {
    match status.code() {
        Some(0) => ExitStatus::NormalExit(0),
        _ if terminate_requested => ExitStatus::TerminatedBySupervisor,
        Some(code) => ExitStatus::NormalExit(code),
        None => ExitStatus::TerminatedExternally {
            signal: exit_signal(&status),
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Spawn `program` in `working_dir` with piped output.
pub fn start(
    program: &Path,
    args: &[String],
    working_dir: &Path,
) -> Result<(ProcessHandle, OutputLines), ProcessError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    let pid = child.id();
    tracing::info!(program = %program.display(), ?pid, ?args, "job spawned");

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, OutputStream::Stderr, tx));
    }

    let terminator = ProcessTerminator::new(pid);
    let reaper = tokio::spawn(reap(child, terminator.clone()));
    Ok((ProcessHandle { reaper, terminator }, OutputLines { rx }))
}

/// Forward lines from one pipe until it closes. Keeps reading after the
/// receiver is gone so the child never blocks on a full pipe.
async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                let _ = tx.send(OutputLine { stream, text });
            }
            Err(e) => {
                tracing::warn!(?stream, error = %e, "job output read failed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sh(script: &str) -> (ProcessHandle, OutputLines) {
        let dir = std::env::temp_dir();
        start(
            &PathBuf::from("sh"),
            &["-c".to_string(), script.to_string()],
            &dir,
        )
        .unwrap()
    }

    async fn collect(lines: &mut OutputLines) -> Vec<OutputLine> {
        let mut out = Vec::new();
        while let Some(l) = lines.next_line().await {
            out.push(l);
        }
        out
    }

    #[tokio::test]
    async fn streams_lines_and_exit_code() {
        let (handle, mut lines) = sh("echo 'Step 1'; echo oops >&2; echo 'Step 2'; exit 3");
        let out = collect(&mut lines).await;
        let stdout: Vec<&str> = out
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["Step 1", "Step 2"]);
        assert!(out
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.text == "oops"));
        assert_eq!(handle.wait().await.unwrap(), ExitStatus::NormalExit(3));
    }

    #[tokio::test]
    async fn terminate_is_reported_as_supervisor_stop() {
        let (handle, mut lines) = sh("echo ready; exec sleep 30");
        let first = lines.next_line().await.unwrap();
        assert_eq!(first.text, "ready");

        let terminator = handle.terminator();
        assert!(terminator.pid().is_some());
        assert!(handle.terminate());
        assert!(!handle.terminate());

        let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ExitStatus::TerminatedBySupervisor);
        assert_eq!(terminator.signals_sent(), 1);
        assert!(terminator.has_exited());
        assert_eq!(terminator.pid(), None);
        assert!(collect(&mut lines).await.is_empty());
    }

    #[tokio::test]
    async fn terminate_after_exit_is_a_noop() {
        let (handle, mut lines) = sh("echo done");
        collect(&mut lines).await;
        let terminator = handle.terminator();
        assert_eq!(handle.wait().await.unwrap(), ExitStatus::NormalExit(0));
        assert!(!terminator.terminate());
        assert_eq!(terminator.signals_sent(), 0);
    }

    #[tokio::test]
    async fn kill_escalates_when_term_is_ignored() {
        let (handle, mut lines) = sh("trap '' TERM; echo ready; while :; do sleep 0.05; done");
        assert_eq!(lines.next_line().await.unwrap().text, "ready");

        let terminator = handle.terminator();
        assert!(terminator.terminate());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!terminator.has_exited());
        assert_eq!(terminator.signals_sent(), 1);

        assert!(terminator.kill());
        assert!(!terminator.kill());
        let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ExitStatus::TerminatedBySupervisor);
        assert_eq!(terminator.signals_sent(), 2);
        assert!(!terminator.kill());
    }

    #[tokio::test]
    async fn dropped_handle_is_still_reaped() {
        let (handle, mut lines) = sh("echo bye");
        let terminator = handle.terminator();
        drop(handle);
        collect(&mut lines).await;
        tokio::time::timeout(Duration::from_secs(10), async {
            while !terminator.has_exited() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!terminator.terminate());
    }

    #[tokio::test]
    async fn external_signal_is_not_confused_with_cancel() {
        let (handle, mut lines) = sh("kill -TERM $$");
        collect(&mut lines).await;
        match handle.wait().await.unwrap() {
            ExitStatus::TerminatedExternally { signal } => assert_eq!(signal, Some(libc::SIGTERM)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let err = start(
            &PathBuf::from("./no-such-simulation-binary"),
            &[],
            &std::env::temp_dir(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn success_only_for_zero_exit() {
        assert!(ExitStatus::NormalExit(0).success());
        assert!(!ExitStatus::NormalExit(1).success());
        assert!(!ExitStatus::TerminatedBySupervisor.success());
    }
}
