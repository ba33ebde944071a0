//! The read-dispatch-respond loop.

use std::io::BufRead;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::protocol::{Response, RpcError};

/// Serve requests from `input` until end of input.
///
/// Each line gets exactly one response before the next line is read. Blank
/// lines are skipped. A line that is not valid UTF-8 is answered with a parse
/// error. A read error ends the loop like end of input does; only a failure
/// to write output is returned as an error.
pub fn serve<R: BufRead>(dispatcher: &Dispatcher, mut input: R) -> Result<()> {
    info!("engine started; listening on stdin");
    let mut buf = Vec::new();
    let mut served = 0u64;

    loop {
        buf.clear();
        match input.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "error reading input; shutting down");
                break;
            }
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                dispatcher
                    .output()
                    .send(&Response::failure(
                        serde_json::Value::Null,
                        RpcError::parse_error(format!("input is not valid UTF-8: {e}")),
                    ))
                    .context("writing parse error")?;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        debug!(bytes = line.len(), "request line");
        dispatcher
            .serve_line(line)
            .context("writing response")?;
        served += 1;
    }

    info!(served, "input closed; engine shutting down");
    Ok(())
}
