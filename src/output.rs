//! The single write gate in front of the output stream.
//!
//! Responses from the dispatch loop and notifications from any number of
//! stream threads all go through one [`OutputSink`]. A message is serialized
//! before the gate is taken; the whole line, newline included, is then
//! written and flushed while holding it, so lines never interleave.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::error;

use crate::protocol::{Response, RpcError};

#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write one message as one line.
    pub fn send(&self, message: &Response) -> Result<()> {
        let line = match encode_line(message) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "encoding response failed; sending internal error instead");
                let fallback = Response::failure(
                    message.id.clone(),
                    RpcError::internal("Internal error marshalling response"),
                );
                encode_line(&fallback)?
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(line.as_bytes())
            .context("writing output line")?;
        writer.flush().context("flushing output")?;
        Ok(())
    }
}

fn encode_line(message: &Response) -> Result<String> {
    let mut line = serde_json::to_string(message).context("encoding response")?;
    line.push('\n');
    Ok(line)
}
