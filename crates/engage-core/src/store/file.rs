//! JSON-lines sample log
//!
//! One file per session under a root directory. Each append writes complete
//! lines and syncs before returning; a failed write or sync rolls the file
//! back to its previous length. A torn final line left by a crash is ignored
//! on load and truncated before the next append to that session. An
//! unreadable line anywhere else is reported as corrupt.

use super::SampleLog;
use crate::error::StoreError;
use crate::types::{EngagementSample, SessionId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// File-backed sample log
#[derive(Debug, Clone)]
pub struct FileSampleLog {
    root: PathBuf,
}

impl FileSampleLog {
    /// Open (creating if needed) a log rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io_error(&root, e))?;
        Ok(Self { root })
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }

    /// Truncate an unterminated trailing record and return the clean length
    async fn repair_tail(file: &mut File, path: &Path) -> Result<u64, StoreError> {
        let io = |e: std::io::Error| StoreError::io_error(path, e);
        let len = file.metadata().await.map_err(io)?.len();
        if len == 0 {
            return Ok(0);
        }
        file.seek(SeekFrom::End(-1)).await.map_err(io)?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await.map_err(io)?;
        if last[0] == b'\n' {
            return Ok(len);
        }

        file.seek(SeekFrom::Start(0)).await.map_err(io)?;
        let mut content = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
        file.read_to_end(&mut content).await.map_err(io)?;
        let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1);
        tracing::warn!(
            "Truncating {} torn bytes from {}",
            content.len() - keep,
            path.display()
        );
        let keep = keep as u64;
        file.set_len(keep).await.map_err(io)?;
        file.sync_data().await.map_err(io)?;
        Ok(keep)
    }

    async fn write_synced(file: &mut File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(buf).await?;
        file.sync_data().await
    }

    fn decode(
        session_id: &SessionId,
        text: &str,
    ) -> Result<BTreeMap<u64, EngagementSample>, StoreError> {
        let mut samples = BTreeMap::new();
        let terminated = text.ends_with('\n');
        let lines: Vec<&str> = text.lines().collect();
        let last = lines.len().saturating_sub(1);

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EngagementSample>(line) {
                Ok(sample) => {
                    samples.entry(sample.sequence_number).or_insert(sample);
                }
                Err(_) if idx == last && !terminated => {
                    tracing::warn!(
                        "Ignoring torn trailing record in log for session {}",
                        session_id
                    );
                }
                Err(_) => {
                    return Err(StoreError::Corrupt {
                        session_id: *session_id,
                        line: idx + 1,
                    })
                }
            }
        }
        Ok(samples)
    }
}

#[async_trait]
impl SampleLog for FileSampleLog {
    async fn append(
        &self,
        session_id: &SessionId,
        samples: &[EngagementSample],
    ) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(samples.len() * 128);
        for sample in samples {
            serde_json::to_writer(&mut buf, sample)?;
            buf.push(b'\n');
        }

        let path = self.session_path(session_id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| StoreError::io_error(&path, e))?;
        let len = Self::repair_tail(&mut file, &path).await?;

        if let Err(e) = Self::write_synced(&mut file, len, &buf).await {
            if let Err(rollback) = file.set_len(len).await {
                tracing::warn!(
                    "Failed to roll back {} to {} bytes: {}",
                    path.display(),
                    len,
                    rollback
                );
            }
            return Err(StoreError::io_error(&path, e));
        }
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Vec<EngagementSample>, StoreError> {
        let path = self.session_path(session_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io_error(&path, e)),
        };
        Ok(Self::decode(session_id, &text)?.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TicketId;
    use chrono::Utc;

    fn sample(session_id: SessionId, seq: u64) -> EngagementSample {
        EngagementSample {
            session_id,
            sequence_number: seq,
            playback_position_seconds: 1.5,
            score: 0.25,
            client_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_and_reload_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let id = TicketId::generate();
        let second = sample(id, 2);

        let log = FileSampleLog::open(dir.path()).await.unwrap();
        log.append(&id, &[second.clone(), sample(id, 1)]).await.unwrap();

        let reopened = FileSampleLog::open(dir.path()).await.unwrap();
        let samples = reopened.load(&id).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sequence_number, 1);
        assert_eq!(samples[1], second);
    }

    #[tokio::test]
    async fn missing_session_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileSampleLog::open(dir.path()).await.unwrap();
        assert!(log.load(&TicketId::generate()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_lines_keep_first() {
        let dir = tempfile::tempdir().unwrap();
        let id = TicketId::generate();
        let log = FileSampleLog::open(dir.path()).await.unwrap();

        let mut first = sample(id, 1);
        first.score = 0.9;
        log.append(&id, &[first]).await.unwrap();
        log.append(&id, &[sample(id, 1)]).await.unwrap();

        let samples = log.load(&id).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].score, 0.9);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let id = TicketId::generate();
        let log = FileSampleLog::open(dir.path()).await.unwrap();
        log.append(&id, &[sample(id, 1)]).await.unwrap();

        let path = dir.path().join(format!("{id}.jsonl"));
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"session_id\":\"");
        std::fs::write(&path, text).unwrap();

        assert_eq!(log.load(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_after_torn_line_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let id = TicketId::generate();
        FileSampleLog::open(dir.path())
            .await
            .unwrap()
            .append(&id, &[sample(id, 1)])
            .await
            .unwrap();

        let path = dir.path().join(format!("{id}.jsonl"));
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"sequence_number\":");
        std::fs::write(&path, text).unwrap();

        let restarted = FileSampleLog::open(dir.path()).await.unwrap();
        restarted.append(&id, &[sample(id, 2)]).await.unwrap();

        let seqs: Vec<u64> = restarted
            .load(&id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn retry_after_partial_write_keeps_log_readable() {
        let dir = tempfile::tempdir().unwrap();
        let id = TicketId::generate();
        let log = FileSampleLog::open(dir.path()).await.unwrap();
        log.append(&id, &[sample(id, 1)]).await.unwrap();

        // bytes left behind by a write that failed halfway
        let path = dir.path().join(format!("{id}.jsonl"));
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"session_id\":\"");
        std::fs::write(&path, text).unwrap();

        log.append(&id, &[sample(id, 2)]).await.unwrap();
        log.append(&id, &[sample(id, 3)]).await.unwrap();

        let seqs: Vec<u64> = log
            .load(&id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let id = TicketId::generate();
        let log = FileSampleLog::open(dir.path()).await.unwrap();

        let path = dir.path().join(format!("{id}.jsonl"));
        std::fs::write(&path, "garbage\n").unwrap();
        log.append(&id, &[sample(id, 1)]).await.unwrap();

        let err = log.load(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }
}
