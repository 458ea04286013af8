//! Append-only per-execution log with a kind prefix on every line
//! (spec §2 "Log writer"). Grounded in the teacher's `session::events::EventLog`
//! (lazy-opened handle behind a mutex) generalized to track byte/line counts
//! and flush deterministically on close.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Stdout,
    Stderr,
    System,
}

impl LineKind {
    fn prefix(self) -> &'static str {
        match self {
            LineKind::Stdout => "stdout",
            LineKind::Stderr => "stderr",
            LineKind::System => "system",
        }
    }
}

/// Running byte/line counters, reported back to the execution row via
/// `Storage::update_execution_counts`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCounts {
    pub bytes: u64,
    pub lines: u64,
}

pub struct LogWriter {
    path: PathBuf,
    file: Option<File>,
    counts: LogCounts,
}

impl LogWriter {
    /// Path convention: `{log_dir}/executions/{execution_id}.log`.
    pub fn path_for(log_dir: &Path, execution_id: &str) -> PathBuf {
        log_dir.join("executions").join(format!("{execution_id}.log"))
    }

    pub async fn create(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Some(file),
            counts: LogCounts::default(),
        })
    }

    pub fn counts(&self) -> LogCounts {
        self.counts
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `line` framed as `{kind}: {line}\n`. `line` should not itself
    /// contain a trailing newline.
    pub async fn write_line(&mut self, kind: LineKind, line: &str) -> Result<()> {
        let framed = format!("{}: {}\n", kind.prefix(), line);
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("log writer already closed"))?;
        file.write_all(framed.as_bytes()).await?;
        self.counts.bytes += framed.len() as u64;
        self.counts.lines += 1;
        Ok(())
    }

    /// Flush and drop the handle. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        // Best-effort: an explicit `close().await` is preferred, but a
        // caller that forgets still gets a flushed file on drop via the
        // tokio::fs::File destructor (which schedules a blocking close).
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_kind_prefixed_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = LogWriter::path_for(dir.path(), "exec-1");
        let mut writer = LogWriter::create(path.clone()).await.unwrap();
        writer.write_line(LineKind::Stdout, "hello").await.unwrap();
        writer.write_line(LineKind::Stderr, "oops").await.unwrap();
        writer.close().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "stdout: hello\nstderr: oops\n");
        assert_eq!(writer.counts().lines, 2);
        assert_eq!(writer.counts().bytes, content.len() as u64);
    }

    #[tokio::test]
    async fn path_for_matches_convention() {
        let dir = tempfile::tempdir().unwrap();
        let path = LogWriter::path_for(dir.path(), "abc");
        assert_eq!(path, dir.path().join("executions").join("abc.log"));
    }
}
