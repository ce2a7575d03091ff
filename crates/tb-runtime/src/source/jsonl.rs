use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use orion_error::compat_prelude::*;
use orion_error::prelude::*;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use tb_core::error::{CoreError, CoreReason, CoreResult};
use tb_core::source::{Offset, PartitionId, PartitionReader, SourceRecord};

/// Tails one newline-delimited JSON file. The offset of a record is its
/// zero-based line number.
///
/// The file is opened lazily, so a partition whose file does not exist yet
/// simply reports no data. A trailing line without a newline is held back
/// until the writer finishes it.
///
/// A read error never moves the position past a line that was not handed
/// out: lines read before the error are still returned, the error is
/// reported by the following poll, and the file is reopened at the
/// position after that.
pub struct JsonlPartitionReader {
    partition: PartitionId,
    path: PathBuf,
    file: Option<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    /// Next offset handed out by `poll`.
    position: Offset,
    /// Line number of the next complete line the file cursor will yield.
    cursor: Offset,
    pending: Vec<u8>,
    deferred: Option<CoreError>,
}

impl JsonlPartitionReader {
    pub fn new(partition: PartitionId, path: PathBuf, start: Offset) -> Self {
        Self {
            partition,
            path,
            file: None,
            position: start.max(0),
            cursor: 0,
            pending: Vec::new(),
            deferred: None,
        }
    }

    /// Move the start position past every complete line currently in the
    /// file. Returns the new position.
    pub async fn seek_to_end(&mut self) -> CoreResult<Offset> {
        let lines = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes.iter().filter(|b| **b == b'\n').count() as Offset,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e).owe(CoreReason::SourceRead),
        };
        self.position = self.position.max(lines);
        Ok(self.position)
    }

    async fn open(&mut self) -> CoreResult<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        match File::open(&self.path).await {
            Ok(f) => {
                self.file = Some(BufReader::new(Box::new(f)));
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).owe(CoreReason::SourceRead),
        }
    }

    /// Drop the open file so the next poll rereads from the top and skips
    /// to `position`.
    fn reset(&mut self) {
        self.file = None;
        self.cursor = 0;
        self.pending.clear();
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[async_trait]
impl PartitionReader for JsonlPartitionReader {
    fn partition(&self) -> PartitionId {
        self.partition
    }

    fn position(&self) -> Offset {
        self.position
    }

    async fn poll(&mut self, max: usize) -> CoreResult<Vec<SourceRecord>> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        if !self.open().await? {
            return Ok(Vec::new());
        }
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(file) = self.file.as_mut() else {
                break;
            };
            let n = match file.read_until(b'\n', &mut self.pending).await {
                Ok(n) => n,
                Err(e) => {
                    self.reset();
                    let err = StructError::from(CoreReason::SourceRead)
                        .with_detail(format!("{}: {e}", self.path.display()));
                    if batch.is_empty() {
                        return Err(err);
                    }
                    self.deferred = Some(err);
                    break;
                }
            };
            if n == 0 || self.pending.last() != Some(&b'\n') {
                // EOF, possibly mid-line; the partial bytes stay in `pending`.
                break;
            }
            let offset = self.cursor;
            self.cursor += 1;
            if offset >= self.position {
                let payload = trim_line(&self.pending);
                if !payload.iter().all(u8::is_ascii_whitespace) {
                    batch.push(SourceRecord {
                        partition: self.partition,
                        offset,
                        payload: payload.to_vec(),
                    });
                }
                self.position = offset + 1;
            }
            self.pending.clear();
        }
        Ok(batch)
    }
}
