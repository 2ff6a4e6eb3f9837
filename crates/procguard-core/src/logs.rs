//! Per-process log files: append-only `{name}.out` / `{name}.err` with
//! size-based rotation and tail reads.

use std::path::{Path, PathBuf};

use procguard_types::ProcessSpec;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct LogManager {
    dir: PathBuf,
    max_bytes: u64,
    keep: usize,
}

/// Line sinks wired to a child's stdout/stderr at spawn time. When a
/// descriptor names an explicit log file both streams share it.
#[derive(Debug, Clone)]
pub struct LogSinks {
    pub stdout: mpsc::UnboundedSender<String>,
    pub stderr: mpsc::UnboundedSender<String>,
}

/// Append-only log file that rolls itself into numbered archives
/// (`name.1` is the newest) once it grows past `limit` bytes.
struct RotatingLog {
    path: PathBuf,
    limit: u64,
    keep: usize,
    written: u64,
    out: tokio::fs::File,
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl RotatingLog {
    async fn create(path: PathBuf, limit: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Picking up an existing file counts its current size toward the
        // rotation limit.
        let written = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        let out = open_append(&path).await?;
        Ok(Self {
            path,
            limit,
            keep,
            written,
            out,
        })
    }

    fn archive(&self, slot: usize) -> PathBuf {
        PathBuf::from(format!("{}.{slot}", self.path.display()))
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        if !buf.ends_with(b"\n") {
            buf.push(b'\n');
        }
        self.out.write_all(&buf).await?;
        self.written = self.written.saturating_add(buf.len() as u64);

        if self.limit > 0 && self.written > self.limit {
            self.roll().await?;
        }
        Ok(())
    }

    /// Slide every archive down one slot, park the full file as `.1` and
    /// start a fresh one.
    async fn roll(&mut self) -> std::io::Result<()> {
        let _ = self.out.flush().await;

        let mut slot = self.keep.saturating_sub(1);
        while slot >= 1 {
            let _ = tokio::fs::rename(self.archive(slot), self.archive(slot + 1)).await;
            slot -= 1;
        }
        let _ = tokio::fs::rename(&self.path, self.archive(1)).await;

        self.out = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    async fn finish(mut self) {
        let _ = self.out.flush().await;
    }
}

fn spawn_writer(path: PathBuf, limit: u64, keep: usize) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let Ok(mut log) = RotatingLog::create(path, limit, keep).await else {
            return;
        };
        while let Some(line) = rx.recv().await {
            if let Err(e) = log.append(&line).await {
                tracing::warn!(error = %e, "log write failed");
            }
        }
        log.finish().await;
    });
    tx
}

impl LogManager {
    pub fn new(dir: PathBuf, max_bytes: u64, keep: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_bytes,
            keep,
        })
    }

    pub fn stdout_path(&self, spec: &ProcessSpec) -> PathBuf {
        match &spec.log_file {
            Some(p) => p.clone(),
            None => self.dir.join(format!("{}.out", spec.name)),
        }
    }

    pub fn stderr_path(&self, spec: &ProcessSpec) -> PathBuf {
        match &spec.log_file {
            Some(p) => p.clone(),
            None => self.dir.join(format!("{}.err", spec.name)),
        }
    }

    /// Fresh writer tasks for one run of a process. Old sinks die when
    /// their senders are dropped on restart.
    pub fn sinks_for(&self, spec: &ProcessSpec) -> LogSinks {
        let stdout = spawn_writer(self.stdout_path(spec), self.max_bytes, self.keep);
        let stderr = if spec.log_file.is_some() {
            stdout.clone()
        } else {
            spawn_writer(self.stderr_path(spec), self.max_bytes, self.keep)
        };
        LogSinks { stdout, stderr }
    }

    /// Last `lines` lines of the process's stdout log, pulling from the
    /// most recent rotated file when the current one is short.
    pub fn tail(&self, spec: &ProcessSpec, lines: usize) -> std::io::Result<Vec<String>> {
        let path = self.stdout_path(spec);
        let mut out = tail_file(&path, lines)?;
        if out.len() < lines {
            let rotated = PathBuf::from(format!("{}.1", path.display()));
            let missing = lines - out.len();
            let mut older = tail_file(&rotated, missing)?;
            older.append(&mut out);
            out = older;
        }
        Ok(out)
    }

    /// Delete the files belonging to a deregistered process.
    pub fn remove(&self, spec: &ProcessSpec) {
        for base in [self.stdout_path(spec), self.stderr_path(spec)] {
            let _ = std::fs::remove_file(&base);
            for i in 1..=self.keep {
                let _ = std::fs::remove_file(format!("{}.{}", base.display(), i));
            }
        }
    }
}

fn tail_file(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ProcessSpec {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "command": "true",
            "working_dir": "/tmp",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn writes_and_tails_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LogManager::new(dir.path().to_path_buf(), 1024 * 1024, 3).unwrap();
        let spec = spec("svc");
        let sinks = mgr.sinks_for(&spec);

        for i in 0..10 {
            sinks.stdout.send(format!("line {i}")).unwrap();
        }
        drop(sinks);
        // Writer task drains on sender drop.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let tail = mgr.tail(&spec, 3).unwrap();
        assert_eq!(tail, vec!["line 7", "line 8", "line 9"]);
    }

    #[tokio::test]
    async fn rotates_when_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.out");
        let mut log = RotatingLog::create(path.clone(), 64, 2).await.unwrap();

        for i in 0..30 {
            log.append(&format!("0123456789 {i}")).await.unwrap();
        }
        log.finish().await;

        assert!(path.exists());
        assert!(PathBuf::from(format!("{}.1", path.display())).exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 64);
    }

    #[tokio::test]
    async fn tail_spans_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LogManager::new(dir.path().to_path_buf(), 1024 * 1024, 3).unwrap();
        let spec = spec("svc");
        let path = mgr.stdout_path(&spec);
        std::fs::write(format!("{}.1", path.display()), "old 1\nold 2\n").unwrap();
        std::fs::write(&path, "new 1\n").unwrap();

        let tail = mgr.tail(&spec, 3).unwrap();
        assert_eq!(tail, vec!["old 1", "old 2", "new 1"]);
    }
}
