//! Bounded in-memory pipes connecting pipeline stages.
//!
//! A pipe carries chunks over a `sync_channel`, so a slow reader blocks the
//! writer once [`PIPE_DEPTH`] chunks are in flight. The writer must call
//! [`PipeWriter::finish`] to signal a clean end of stream; a writer dropped
//! without finishing makes the reader fail instead of seeing EOF, so a stage
//! never mistakes a failed upstream for a complete one.
use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

/// Chunks buffered between two stages.
pub const PIPE_DEPTH: usize = 8;

enum Message {
    Data(Vec<u8>),
    End,
}

pub(crate) struct PipeWriter {
    tx: SyncSender<Message>,
}

pub(crate) struct PipeReader {
    rx: Receiver<Message>,
    chunk: Vec<u8>,
    pos: usize,
    finished: bool,
}

pub(crate) fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(PIPE_DEPTH);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
            finished: false,
        },
    )
}

pub(crate) fn upstream_aborted() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "upstream stage aborted")
}

pub(crate) fn downstream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "downstream stage closed")
}

impl PipeWriter {
    /// Signals a clean end of stream.
    pub(crate) fn finish(self) -> io::Result<()> {
        self.tx.send(Message::End).map_err(|_| downstream_closed())
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Message::Data(buf.to_vec()))
            .map_err(|_| downstream_closed())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            if self.finished {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Message::Data(data)) => {
                    self.chunk = data;
                    self.pos = 0;
                }
                Ok(Message::End) => self.finished = true,
                Err(_) => return Err(upstream_aborted()),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn finished_writer_yields_eof() {
        let (mut tx, mut rx) = pipe();
        let handle = thread::spawn(move || {
            for i in 0..100u8 {
                tx.write_all(&[i; 1000]).unwrap();
            }
            tx.finish().unwrap();
        });
        let mut out = Vec::new();
        rx.read_to_end(&mut out).unwrap();
        handle.join().unwrap();
        assert_eq!(out.len(), 100_000);
        assert_eq!(out[99_999], 99);
    }

    #[test]
    fn dropped_writer_is_an_error_not_eof() {
        let (mut tx, mut rx) = pipe();
        tx.write_all(b"half").unwrap();
        drop(tx);
        let mut out = Vec::new();
        let err = rx.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(out, b"half");
    }

    #[test]
    fn dropped_reader_breaks_the_writer() {
        let (mut tx, rx) = pipe();
        drop(rx);
        assert_eq!(tx.write(b"x").unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
