use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    error::{Error, Result},
    log_buffer::LogSink,
};

const MAX_LINE_BYTES: usize = 16 * 1024;
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// 0 leaves RLIMIT_NOFILE untouched.
    pub nofile_limit: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub runtime: Duration,
    pub error: Option<String>,
}

impl ExitInfo {
    fn lost() -> Self {
        Self {
            code: None,
            signal: None,
            runtime: Duration::ZERO,
            error: Some("process watcher went away".to_string()),
        }
    }

    fn from_status(status: std::process::ExitStatus, runtime: Duration) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            runtime,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        if let Some(err) = &self.error {
            return format!("wait failed: {err}");
        }
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => format!("killed by signal {sig}"),
            (None, None) => "exited".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum Startup {
    Ready,
    Exited(ExitInfo),
}

/// A live child process running in its own process group. The reaper task
/// owns the `Child`; everything else talks to it through this handle.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    pgid: Option<i32>,
    stdin: Mutex<Option<ChildStdin>>,
    stdin_closed: AtomicBool,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children must not outlive a crashed orchestrator.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn apply_limits(nofile_limit: u64) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> std::io::Result<()> {
            let lim = libc::rlimit {
                rlim_cur: limit as libc::rlim_t,
                rlim_max: limit as libc::rlim_t,
            };
            let rc = unsafe { libc::setrlimit(resource, &lim) };
            if rc == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        }

        set_rlimit(libc::RLIMIT_CORE, 0)?;

        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }

        if nofile_limit > 0 {
            set_rlimit(libc::RLIMIT_NOFILE, nofile_limit)?;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = nofile_limit;

    Ok(())
}

/// Splits a byte stream into lines. At most `cap` bytes of a line are kept;
/// the rest is discarded as it arrives, so memory stays bounded even when a
/// process never writes a newline.
#[derive(Debug)]
struct LineSplitter {
    line: Vec<u8>,
    cap: usize,
}

impl LineSplitter {
    fn new(cap: usize) -> Self {
        Self {
            line: Vec::new(),
            cap,
        }
    }

    fn push(&mut self, mut chunk: &[u8], mut emit: impl FnMut(&[u8])) {
        while let Some(pos) = chunk.iter().position(|b| *b == b'\n') {
            self.keep(&chunk[..pos]);
            emit(&self.line);
            self.line.clear();
            chunk = &chunk[pos + 1..];
        }
        self.keep(chunk);
    }

    fn keep(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.line.len());
        self.line.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Trailing output without a final newline.
    fn finish(self, mut emit: impl FnMut(&[u8])) {
        if !self.line.is_empty() {
            emit(&self.line);
        }
    }
}

fn emit_line(sink: &LogSink, bytes: &[u8], is_error: bool) {
    let text = String::from_utf8_lossy(bytes);
    sink.emit(text.trim_end_matches('\r').to_string(), is_error);
}

fn pump_lines<R>(reader: R, sink: LogSink, is_error: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut lines = LineSplitter::new(MAX_LINE_BYTES);
        loop {
            let chunk = match reader.fill_buf().await {
                Ok([]) | Err(_) => break,
                Ok(chunk) => chunk,
            };
            let used = chunk.len();
            lines.push(chunk, |line| emit_line(&sink, line, is_error));
            reader.consume(used);
        }
        lines.finish(|line| emit_line(&sink, line, is_error));
    })
}

/// Spawns `spec` in a fresh session. stdout lines land in `sink` as normal
/// output, stderr lines as errors.
pub fn spawn(spec: &SpawnSpec, sink: &LogSink) -> Result<ProcessHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    #[cfg(unix)]
    {
        let nofile_limit = spec.nofile_limit;
        unsafe {
            cmd.pre_exec(move || {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                apply_limits(nofile_limit)
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Spawn(format!("{} (cwd {}): {e}", spec.program, spec.cwd.display())))?;
    let started = Instant::now();
    let pid = child
        .id()
        .ok_or_else(|| Error::Spawn("process exited before its pid was known".to_string()))?;

    let stdin = child.stdin.take();
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(pump_lines(out, sink.clone(), false));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(pump_lines(err, sink.clone(), true));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Some(()) = kill_rx.recv() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };

        // Let the readers flush what the process wrote before it died. A
        // grandchild holding the pipe open must not block the exit report.
        let _ = tokio::time::timeout(READER_DRAIN, async {
            for r in readers {
                let _ = r.await;
            }
        })
        .await;

        let info = match status {
            Ok(st) => ExitInfo::from_status(st, started.elapsed()),
            Err(err) => ExitInfo {
                code: None,
                signal: None,
                runtime: started.elapsed(),
                error: Some(err.to_string()),
            },
        };
        let _ = exit_tx.send(Some(info));
    });

    Ok(ProcessHandle {
        pid,
        pgid: Some(pid as i32),
        stdin: Mutex::new(stdin),
        stdin_closed: AtomicBool::new(false),
        exit: exit_rx,
        kill_tx,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    pub fn try_exit(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        match rx.wait_for(|v| v.is_some()).await {
            Ok(v) => v.as_ref().cloned().unwrap_or_else(ExitInfo::lost),
            Err(_) => ExitInfo::lost(),
        }
    }

    /// Waits out the startup window. A process still alive at the end of it
    /// is considered started.
    pub async fn wait_for_startup(&self, window: Duration) -> Startup {
        match tokio::time::timeout(window, self.wait()).await {
            Ok(info) => Startup::Exited(info),
            Err(_) => match self.try_exit() {
                Some(info) => Startup::Exited(info),
                None => Startup::Ready,
            },
        }
    }

    fn signal_group(&self, _sig: i32) {
        // Once reaped, the pgid may belong to somebody else.
        if self.try_exit().is_some() {
            return;
        }
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, _sig);
            }
        }
    }

    /// Never waits: a writer blocked on a full pipe holds the lock and drops
    /// the pipe itself when its deadline passes or the process dies.
    fn close_stdin(&self) {
        self.stdin_closed.store(true, Ordering::Release);
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
    }

    /// Closes stdin and sends SIGTERM to the group, then waits up to `grace`.
    pub async fn terminate(&self, grace: Duration) -> Result<ExitInfo> {
        self.close_stdin();

        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = self.kill_tx.try_send(());

        tokio::time::timeout(grace, self.wait())
            .await
            .map_err(|_| Error::ForceKillRequired)
    }

    pub async fn force_kill(&self, wait: Duration) -> Result<ExitInfo> {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        let _ = self.kill_tx.try_send(());

        tokio::time::timeout(wait, self.wait()).await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("pid {} did not exit after SIGKILL", self.pid),
            ))
        })
    }

    /// Writes `text` to the process's stdin. Waiting for the lock and the
    /// write itself share one `timeout`; on expiry the pipe is dropped, so a
    /// process that stops reading gets EOF and later writes fail fast.
    pub async fn write_stdin(&self, text: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = tokio::time::timeout_at(deadline, self.stdin.lock())
            .await
            .map_err(|_| Error::StdinBlocked)?;
        if self.stdin_closed.load(Ordering::Acquire) || self.try_exit().is_some() {
            guard.take();
            return Err(Error::NotRunning);
        }
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::NotRunning);
        };

        let write = async {
            stdin.write_all(text.as_bytes()).await?;
            stdin.flush().await
        };
        let outcome = tokio::time::timeout_at(deadline, write).await;
        match outcome {
            Ok(Ok(())) => {
                if self.stdin_closed.load(Ordering::Acquire) {
                    guard.take();
                }
                Ok(())
            }
            // Broken pipe: the reader side is gone.
            Ok(Err(_)) => {
                guard.take();
                Err(Error::NotRunning)
            }
            Err(_) => {
                guard.take();
                tracing::warn!(pid = self.pid, "stdin write timed out, closing the pipe");
                Err(Error::StdinBlocked)
            }
        }
    }
}

/// Runs the dependency installer for `requirements`, streaming its output into
/// `sink`. A missing requirements file is not an error.
pub async fn install_requirements(
    installer: &[String],
    workdir: &Path,
    requirements: &Path,
    sink: &LogSink,
    timeout: Duration,
) -> Result<()> {
    let Some((program, args)) = installer.split_first() else {
        return Ok(());
    };
    if tokio::fs::metadata(requirements).await.is_err() {
        sink.agent("no requirements.txt found, skipping dependency install");
        return Ok(());
    }

    sink.agent(format!(
        "installing dependencies: {} {} {}",
        program,
        args.join(" "),
        requirements.display()
    ));

    let mut child = Command::new(program)
        .args(args)
        .arg(requirements)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Spawn(format!("dependency installer {program}: {e}")))?;

    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(pump_lines(out, sink.clone(), false));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(pump_lines(err, sink.clone(), true));
    }

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            sink.agent_error("dependency install timed out");
            return Err(Error::Spawn("dependency install timed out".to_string()));
        }
    };
    let _ = tokio::time::timeout(READER_DRAIN, async {
        for r in readers {
            let _ = r.await;
        }
    })
    .await;

    if !status.success() {
        let info = ExitInfo::from_status(status, Duration::ZERO);
        sink.agent_error(format!("dependency install failed ({})", info.describe()));
        return Err(Error::Spawn(format!(
            "dependency install failed ({})",
            info.describe()
        )));
    }
    sink.agent("dependencies installed");
    Ok(())
}
