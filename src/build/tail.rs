//! Poll-based tailing of a build log.
//!
//! The log is a plain append-only file written by the image tool. A reader
//! follows it line by line; at end-of-file it asks whether the build is
//! terminal. If not, it sleeps for the poll interval and tries again. Once the
//! build is terminal it drains whatever is left and stops.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

/// Lazy sequence of log chunks, finite once the build is terminal.
pub type LogStream = Box<dyn Iterator<Item = Vec<u8>> + Send>;

/// Follows a log file until `is_terminal` reports the build has ended.
pub struct LogTail<F> {
    reader: BufReader<File>,
    is_terminal: F,
    poll_interval: Duration,
    /// Bytes of an unfinished line seen at end-of-file.
    pending: Vec<u8>,
    draining: bool,
    done: bool,
}

impl<F> LogTail<F>
where
    F: Fn() -> bool,
{
    pub fn open(path: &Path, is_terminal: F, poll_interval: Duration) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening build log '{}'", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
            is_terminal,
            poll_interval,
            pending: Vec::new(),
            draining: false,
            done: false,
        })
    }
}

impl<F> Iterator for LogTail<F>
where
    F: Fn() -> bool,
{
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }

        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    if self.draining {
                        self.done = true;
                        if self.pending.is_empty() {
                            return None;
                        }
                        return Some(std::mem::take(&mut self.pending));
                    }
                    // The writer exits before the status turns terminal, so one
                    // more read after observing terminal picks up its last bytes.
                    if (self.is_terminal)() {
                        self.draining = true;
                        continue;
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Ok(_) => {
                    if self.pending.ends_with(b"\n") {
                        return Some(std::mem::take(&mut self.pending));
                    }
                    // Partial line; wait for the rest of it.
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reading build log failed; ending stream");
                    self.done = true;
                    if self.pending.is_empty() {
                        return None;
                    }
                    return Some(std::mem::take(&mut self.pending));
                }
            }
        }
    }
}
