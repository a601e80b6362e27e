// src/upstream/tee.rs
//! Bounded hand-off from an async download to a blocking verifier
//!
//! The download task writes every chunk to its sink and then pushes the same
//! [`Bytes`] (a refcount bump, not a copy) into a bounded channel. A verifier
//! running on the blocking pool reads the channel through [`TeeReader`],
//! which implements [`std::io::Read`]. Once `depth` chunks are queued the
//! download stalls until the verifier catches up, so memory stays bounded and
//! verification finishes exactly when the stream does.

use bytes::Bytes;
use std::io::{self, Read};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Chunks buffered between the download and the verifier
pub const DEFAULT_TEE_DEPTH: usize = 16;

/// Producer half, owned by the download task
pub type TeeSender = mpsc::Sender<Bytes>;

/// Create a tee with room for `depth` in-flight chunks
pub fn tee_channel(depth: usize) -> (TeeSender, TeeReader) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        tx,
        TeeReader {
            rx: Mutex::new(rx),
            current: Bytes::new(),
        },
    )
}

/// Consumer half. Yields EOF once every sender is dropped.
pub struct TeeReader {
    // The mutex only makes the reader `Sync`; `read` goes through `get_mut`.
    rx: Mutex<mpsc::Receiver<Bytes>>,
    current: Bytes,
}

impl Read for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.current.is_empty() {
            let rx = self
                .rx
                .get_mut()
                .map_err(|_| io::Error::other("tee receiver poisoned"))?;
            match rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len());
        let chunk = self.current.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tee_delivers_bytes_in_order() {
        let (tx, mut reader) = tee_channel(2);

        let consumer = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        });

        for part in [&b"hello "[..], b"", b"stream ", b"tee"] {
            tx.send(Bytes::copy_from_slice(part)).await.unwrap();
        }
        drop(tx);

        assert_eq!(consumer.await.unwrap(), b"hello stream tee");
    }

    #[tokio::test]
    async fn test_tee_applies_backpressure() {
        let (tx, reader) = tee_channel(1);

        tx.send(Bytes::from_static(b"a")).await.unwrap();
        // Buffer full and nobody reading: the second send must not complete.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), tx.send(Bytes::from_static(b"b"))).await;
        assert!(blocked.is_err());

        drop(reader);
        assert!(tx.send(Bytes::from_static(b"c")).await.is_err());
    }

    #[tokio::test]
    async fn test_small_reads_split_chunks() {
        let (tx, mut reader) = tee_channel(4);
        tx.send(Bytes::from_static(b"abcdef")).await.unwrap();
        drop(tx);

        let out = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4];
            let first = reader.read(&mut buf).unwrap();
            let head = buf[..first].to_vec();
            let second = reader.read(&mut buf).unwrap();
            let tail = buf[..second].to_vec();
            let eof = reader.read(&mut buf).unwrap();
            (head, tail, eof)
        })
        .await
        .unwrap();

        assert_eq!(out.0, b"abcd");
        assert_eq!(out.1, b"ef");
        assert_eq!(out.2, 0);
    }
}
