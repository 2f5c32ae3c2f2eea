use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use botdock_process::LogEntry;
use chrono::Utc;
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Bounded FIFO of log entries for one bot.
///
/// Appenders (the stdout/stderr readers) and readers (status polling) share a
/// single lock that is held only for the push or the copy.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, line: impl Into<String>, is_error: bool) {
        self.push(LogEntry {
            timestamp: Utc::now(),
            line: line.into(),
            is_error,
        });
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The `n` most recent entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Counts error lines in a sliding window.
#[derive(Debug)]
struct FloodGuard {
    max_lines: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl FloodGuard {
    fn new(max_lines: usize, window: Duration) -> Self {
        Self {
            max_lines,
            window,
            hits: VecDeque::new(),
        }
    }

    /// Returns true once more than `max_lines` hits fall inside the window.
    fn record(&mut self, now: Instant) -> bool {
        while self
            .hits
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            self.hits.pop_front();
        }
        self.hits.push_back(now);
        self.hits.len() > self.max_lines
    }
}

#[derive(Debug)]
struct FloodTrip {
    guard: Mutex<FloodGuard>,
    token: CancellationToken,
}

/// Write side of a bot's log: in-memory buffer, optional console file, and
/// the flood guard for the current run.
#[derive(Clone, Debug)]
pub struct LogSink {
    buffer: Arc<LogBuffer>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
    flood: Option<Arc<FloodTrip>>,
}

impl LogSink {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self {
            buffer,
            file_tx: None,
            flood: None,
        }
    }

    pub fn with_file(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.file_tx = Some(tx);
        self
    }

    /// `token` is cancelled when the error-line rate exceeds the limit.
    pub fn with_flood_guard(
        mut self,
        max_lines: usize,
        window: Duration,
        token: CancellationToken,
    ) -> Self {
        self.flood = Some(Arc::new(FloodTrip {
            guard: Mutex::new(FloodGuard::new(max_lines, window)),
            token,
        }));
        self
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    pub fn emit(&self, line: impl Into<String>, is_error: bool) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            line: line.into(),
            is_error,
        };
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(entry.render());
        }
        self.buffer.push(entry);

        if is_error && let Some(flood) = &self.flood {
            let tripped = flood
                .guard
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(Instant::now());
            if tripped && !flood.token.is_cancelled() {
                flood.token.cancel();
            }
        }
    }

    /// Orchestrator-originated line, tagged so it stands out from bot output.
    pub fn agent(&self, message: impl AsRef<str>) {
        self.emit(format!("[botdock] {}", message.as_ref()), false);
    }

    pub fn agent_error(&self, message: impl AsRef<str>) {
        self.emit(format!("[botdock] {}", message.as_ref()), true);
    }
}

/// Lines drained from the channel per disk write.
const CONSOLE_BATCH_LINES: usize = 256;

/// On-disk copy of a bot's console. Holds at most `cap` bytes in
/// `console.log`; older content moves to `console.log.1` ..
/// `console.log.<keep>`, newest first.
struct ConsoleFile {
    path: PathBuf,
    cap: u64,
    keep: usize,
    len: u64,
    out: BufWriter<tokio::fs::File>,
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl ConsoleFile {
    async fn open(path: PathBuf, cap: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = open_append(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            cap,
            keep: keep.max(1),
            len,
            out: BufWriter::new(file),
        })
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn shift_backups(&mut self) -> std::io::Result<()> {
        self.out.flush().await?;
        let _ = tokio::fs::remove_file(self.backup(self.keep)).await;
        for n in (1..self.keep).rev() {
            let _ = tokio::fs::rename(self.backup(n), self.backup(n + 1)).await;
        }
        tokio::fs::rename(&self.path, self.backup(1)).await?;
        self.out = BufWriter::new(open_append(&self.path).await?);
        self.len = 0;
        Ok(())
    }

    /// Appends a batch of newline-terminated lines. A batch that would push
    /// a non-empty file past `cap` goes to a fresh file.
    async fn append(&mut self, batch: &str) -> std::io::Result<()> {
        let n = batch.len() as u64;
        if self.cap > 0 && self.len > 0 && self.len.saturating_add(n) > self.cap {
            self.shift_backups().await?;
        }
        self.out.write_all(batch.as_bytes()).await?;
        self.out.flush().await?;
        self.len = self.len.saturating_add(n);
        Ok(())
    }
}

fn push_line(batch: &mut String, line: &str) {
    batch.push_str(line.trim_end_matches('\n'));
    batch.push('\n');
}

/// Spawns the console file writer. The task ends once every sender is dropped.
pub fn spawn_console_writer(
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut console = match ConsoleFile::open(path.clone(), max_bytes, max_files).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "console log unavailable");
                return;
            }
        };
        let mut batch = String::new();
        while let Some(first) = rx.recv().await {
            batch.clear();
            push_line(&mut batch, &first);
            for _ in 1..CONSOLE_BATCH_LINES {
                match rx.try_recv() {
                    Ok(line) => push_line(&mut batch, &line),
                    Err(_) => break,
                }
            }
            if let Err(err) = console.append(&batch).await {
                tracing::warn!(%err, path = %path.display(), "console log write failed");
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity_and_keeps_newest() {
        let buf = LogBuffer::new(1000);
        for i in 0..1500 {
            buf.append(format!("line {i}"), false);
        }
        assert_eq!(buf.len(), 1000);

        let all = buf.all();
        assert_eq!(all.len(), 1000);
        assert_eq!(all.first().unwrap().line, "line 500");
        assert_eq!(all.last().unwrap().line, "line 1499");
        for (offset, entry) in all.iter().enumerate() {
            assert_eq!(entry.line, format!("line {}", 500 + offset));
        }
    }

    #[test]
    fn tail_returns_most_recent_in_order() {
        let buf = LogBuffer::new(10);
        for i in 0..7 {
            buf.append(format!("l{i}"), i % 2 == 0);
        }
        let tail: Vec<_> = buf.tail(3).into_iter().map(|e| e.line).collect();
        assert_eq!(tail, vec!["l4", "l5", "l6"]);
        assert_eq!(buf.tail(100).len(), 7);
        assert!(buf.tail(0).is_empty());
    }

    #[test]
    fn clear_keeps_capacity() {
        let buf = LogBuffer::new(5);
        buf.append("x", true);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 5);
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        let buf = LogBuffer::new(0);
        buf.append("a", false);
        buf.append("b", false);
        assert_eq!(buf.all().len(), 1);
        assert_eq!(buf.all()[0].line, "b");
    }

    #[test]
    fn concurrent_appends_never_tear() {
        let buf = Arc::new(LogBuffer::new(256));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        buf.append(format!("w{w}-{i}"), false);
                    }
                })
            })
            .collect();
        for _ in 0..200 {
            assert!(buf.tail(50).len() <= 50);
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn flood_guard_trips_after_threshold_in_window() {
        let mut guard = FloodGuard::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(!guard.record(t0));
        assert!(!guard.record(t0));
        assert!(!guard.record(t0));
        assert!(guard.record(t0));
    }

    #[test]
    fn flood_guard_forgets_old_hits() {
        let mut guard = FloodGuard::new(2, Duration::from_millis(10));
        let t0 = Instant::now();
        guard.record(t0);
        guard.record(t0);
        let later = t0 + Duration::from_millis(50);
        assert!(!guard.record(later));
    }

    #[test]
    fn sink_trips_flood_token_on_error_lines_only() {
        let token = CancellationToken::new();
        let sink = LogSink::new(Arc::new(LogBuffer::new(100))).with_flood_guard(
            2,
            Duration::from_secs(60),
            token.clone(),
        );
        for _ in 0..10 {
            sink.emit("chatty", false);
        }
        assert!(!token.is_cancelled());
        sink.emit("e1", true);
        sink.emit("e2", true);
        assert!(!token.is_cancelled());
        sink.emit("e3", true);
        assert!(token.is_cancelled());
    }

    #[test]
    fn agent_lines_are_tagged() {
        let sink = LogSink::new(Arc::new(LogBuffer::new(10)));
        sink.agent("hello");
        sink.agent_error("bad");
        let all = sink.buffer().all();
        assert_eq!(all[0].line, "[botdock] hello");
        assert!(!all[0].is_error);
        assert!(all[1].is_error);
    }

    #[tokio::test]
    async fn console_file_rotates_and_keeps_newest_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        let mut console = ConsoleFile::open(path.clone(), 64, 2).await.unwrap();
        for i in 0..20 {
            console
                .append(&format!("line number {i:04}\n"))
                .await
                .unwrap();
        }

        let logs = dir.path().join("logs");
        assert!(path.exists());
        assert!(logs.join("console.log.1").exists());
        assert!(logs.join("console.log.2").exists());
        assert!(!logs.join("console.log.3").exists());
        let current = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(current.len() as u64 <= 64);
        assert!(current.ends_with("line number 0019\n"));
        let previous = tokio::fs::read_to_string(logs.join("console.log.1")).await.unwrap();
        assert!(previous.len() as u64 <= 64);
    }

    #[tokio::test]
    async fn console_file_appends_to_an_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        tokio::fs::write(&path, "earlier run\n").await.unwrap();
        let mut console = ConsoleFile::open(path.clone(), 0, 3).await.unwrap();
        assert_eq!(console.len, 12);
        console.append("this run\n").await.unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text, "earlier run\nthis run\n");
    }

    #[tokio::test]
    async fn console_writer_task_persists_rendered_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        let tx = spawn_console_writer(path.clone(), 1024 * 1024, 2);
        let sink = LogSink::new(Arc::new(LogBuffer::new(10))).with_file(tx);
        sink.emit("first", false);
        sink.emit("second", true);
        drop(sink);

        let mut text = String::new();
        for _ in 0..50 {
            text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if text.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].contains("second"));
    }
}
