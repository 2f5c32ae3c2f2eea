#[cfg(target_os = "linux")]
use std::sync::OnceLock;

use botdock_process::ResourceSample;
use chrono::Utc;
use tokio::time::Instant;

use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

#[cfg(target_os = "linux")]
async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    // comm may contain spaces; fields are counted after the closing paren.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

/// CPU usage between two tick readings, rounded to one decimal place.
fn cpu_percent(prev_ticks: u64, prev_at: Instant, ticks: u64, now: Instant) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    let rounded = (cpu * 10.0).round() / 10.0;
    if rounded.is_finite() {
        rounded.max(0.0)
    } else {
        0.0
    }
}

/// Point-in-time CPU/RSS reader for one pid. CPU needs two readings, so the
/// first sample always reports 0%.
#[derive(Debug)]
pub struct ResourceSampler {
    pid: u32,
    last: Option<(u64, Instant)>,
}

impl ResourceSampler {
    pub fn new(pid: u32) -> Self {
        Self { pid, last: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Fails with [`Error::ProcessGone`] once the pid has no /proc entry.
    pub async fn sample(&mut self) -> Result<ResourceSample> {
        let now = Instant::now();
        let ticks = read_proc_cpu_ticks(self.pid)
            .await
            .ok_or(Error::ProcessGone)?;
        let rss_bytes = read_proc_rss_bytes(self.pid)
            .await
            .ok_or(Error::ProcessGone)?;

        let cpu = self
            .last
            .map(|(prev_ticks, prev_at)| cpu_percent(prev_ticks, prev_at, ticks, now))
            .unwrap_or(0.0);
        self.last = Some((ticks, now));

        Ok(ResourceSample {
            cpu_percent: cpu,
            memory_mb: rss_bytes / MIB,
            sampled_at: Utc::now(),
        })
    }
}
