use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use botdock_process::BotId;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// `<data_root>/bots/<bot_id>`. The id is checked so it can only ever name a
/// single path component.
pub fn bot_dir(data_root: &Path, id: &BotId) -> Result<PathBuf> {
    let raw = id.as_str();
    let valid = !raw.is_empty()
        && raw.len() <= 64
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(Error::InvalidPayload(format!("invalid bot id: {raw:?}")));
    }
    Ok(data_root.join("bots").join(raw))
}

pub fn console_log_path(dir: &Path) -> PathBuf {
    dir.join("logs").join("console.log")
}

pub async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

pub async fn remove_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes `name` inside `dir` via a temp file + rename so a running bot never
/// observes a half-written file. Each call gets its own temp file, so
/// concurrent writers of the same name never interleave.
pub async fn write_file_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::InvalidPayload(format!("invalid file name: {name:?}")));
    }
    ensure_dir(dir).await?;
    let path = dir.join(name);
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = dir.join(format!(".{name}.{}.{seq}.tmp", std::process::id()));

    let written = async {
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(data).await?;
        f.flush().await?;
        drop(f);
        tokio::fs::rename(&tmp, &path).await
    };
    if let Err(err) = written.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

/// Launch metadata persisted next to the payload on every spawn.
#[derive(Debug, serde::Serialize)]
pub struct RunInfo {
    pub bot_id: String,
    pub owner: String,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: String,
}

pub async fn write_run_json(dir: &Path, info: &RunInfo) -> Result<()> {
    let data = serde_json::to_vec_pretty(info)
        .map_err(|e| Error::Io(std::io::Error::other(format!("serialize run.json: {e}"))))?;
    write_file_atomic(dir, "run.json", &data).await
}
