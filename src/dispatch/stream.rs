//! Background task that forwards a build log as notification lines.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, warn};

use crate::build::tail::LogStream;
use crate::output::OutputSink;
use crate::plugin::DistroPlugin;
use crate::protocol::Response;

/// A log stream waiting to be forwarded once its ack has been written.
pub struct StreamTask {
    pub project_id: String,
    pub build_id: String,
    pub plugin: Arc<dyn DistroPlugin>,
    pub stream: LogStream,
}

impl StreamTask {
    /// Forward every chunk as `{"project_id","build_id","log_line"}`, then a
    /// single `stream_end` marker carrying the terminal status.
    pub fn spawn(self, output: OutputSink) -> Result<JoinHandle<()>> {
        let name = format!("stream-{}", self.build_id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run(&output))
            .context("spawning build log stream thread")
    }

    fn run(self, output: &OutputSink) {
        let StreamTask {
            project_id,
            build_id,
            plugin,
            stream,
        } = self;

        let mut lines = 0usize;
        for chunk in stream {
            let text = String::from_utf8_lossy(&chunk);
            let line = text.trim_end_matches(['\n', '\r']);
            let notification = Response::notification(json!({
                "project_id": project_id,
                "build_id": build_id,
                "log_line": line,
            }));
            if let Err(e) = output.send(&notification) {
                warn!(%project_id, %build_id, error = %e, "output closed; stopping log stream");
                return;
            }
            lines += 1;
        }

        debug!(%project_id, %build_id, lines, "log stream finished");
        send_stream_end(output, plugin.as_ref(), &project_id, &build_id, None);
    }
}

/// Write the `stream_end` marker with the build's current status. `error`
/// is set when the stream stopped early and the log was not forwarded.
pub(crate) fn send_stream_end(
    output: &OutputSink,
    plugin: &dyn DistroPlugin,
    project_id: &str,
    build_id: &str,
    error: Option<&str>,
) {
    let status = match plugin.get_build_status(project_id, build_id) {
        Ok(snapshot) => snapshot.status.to_string(),
        Err(e) => {
            warn!(project_id, build_id, error = %e, "build status unavailable at stream end");
            "unknown".to_string()
        }
    };

    let mut end = json!({
        "project_id": project_id,
        "build_id": build_id,
        "stream_end": true,
        "status": status,
    });
    if let Some(error) = error {
        end["error"] = json!(error);
    }
    if let Err(e) = output.send(&Response::notification(end)) {
        warn!(project_id, build_id, error = %e, "failed to write stream end marker");
    }
}
