//! Child output plumbing: record splitting and bounded tails.
//!
//! Capture and remux tools rewrite progress lines with a bare `\r`, so output
//! is split on either `\r` or `\n` rather than with `lines()`.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Longest record kept before a forced split. Guards against a tool that
/// never emits a delimiter.
const MAX_RECORD_BYTES: usize = 16 * 1024;

/// Yields text records delimited by `\n` or `\r`. Blank records are skipped.
pub struct RecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; 4096],
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; 4096],
        }
    }

    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(record) = self.take_record() {
                if record.is_empty() {
                    continue;
                }
                return Ok(Some(record));
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let record = decode(&self.pending);
                self.pending.clear();
                return Ok((!record.is_empty()).then_some(record));
            }
            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }

    fn take_record(&mut self) -> Option<String> {
        let end = match self.pending.iter().position(|b| matches!(b, b'\n' | b'\r')) {
            Some(idx) => idx,
            None if self.pending.len() >= MAX_RECORD_BYTES => MAX_RECORD_BYTES,
            None => return None,
        };
        let record = decode(&self.pending[..end]);
        let skip = self.pending[end..]
            .iter()
            .take_while(|&&b| matches!(b, b'\n' | b'\r'))
            .count();
        self.pending.drain(..end + skip);
        Some(record)
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Keeps the last `capacity` records of a stream.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect(input: &'static [u8]) -> Vec<String> {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = tx.write_all(input).await;
        });
        let mut reader = RecordReader::new(rx);
        let mut records = Vec::new();
        while let Some(line) = reader.next_record().await.unwrap() {
            records.push(line);
        }
        records
    }

    #[tokio::test]
    async fn splits_on_cr_and_lf() {
        let records = collect(b"[cli][info] Opening stream\rsize=1kB\nsize=2kB\r\n\r\nlast").await;
        assert_eq!(
            records,
            vec!["[cli][info] Opening stream", "size=1kB", "size=2kB", "last"]
        );
    }

    #[tokio::test]
    async fn forces_split_on_oversized_record() {
        static LONG: [u8; MAX_RECORD_BYTES + 10] = [b'a'; MAX_RECORD_BYTES + 10];
        let records = collect(&LONG).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].len(), MAX_RECORD_BYTES);
        assert_eq!(records[1].len(), 10);
    }

    #[test]
    fn tail_keeps_most_recent() {
        let mut tail = TailBuffer::new(2);
        tail.push("a");
        tail.push("b");
        tail.push("c");
        assert_eq!(tail.snapshot(), vec!["b", "c"]);
    }
}
