//! Request routing.
//!
//! A request's method is `namespace.action`. The `engine` namespace covers
//! driver discovery and project creation; the `project` namespace covers
//! everything scoped to one existing project and is forwarded to the driver
//! the project is bound to.
//!
//! Project actions are resolved in a fixed order, so the error a caller sees
//! is predictable:
//!
//! 1. unknown action: method not found
//! 2. missing or empty `project_id`: invalid params
//! 3. unknown project: project not found
//! 4. driver gone from the registry: plugin not found
//! 5. action-specific params, then the driver call

pub mod stream;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use self::stream::{send_stream_end, StreamTask};
use crate::logging::request_span;
use crate::output::OutputSink;
use crate::plugin::{CreateParams, DistroPlugin, PluginError, PluginRegistry};
use crate::project::{ProjectRecord, ProjectRegistry};
use crate::protocol::{
    MethodName, Request, Response, RpcError, BUILD_IN_PROGRESS, BUILD_NOT_FOUND,
    PLUGIN_NOT_FOUND,
};

impl From<PluginError> for RpcError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::ProjectNotFound(project_id) => RpcError::project_not_found(&project_id),
            err @ PluginError::BuildNotFound { .. } => {
                RpcError::new(BUILD_NOT_FOUND, err.to_string())
            }
            PluginError::BuildInProgress {
                project_id,
                build_id,
            } => RpcError::new(
                BUILD_IN_PROGRESS,
                format!("A build is already running for project '{project_id}'"),
            )
            .with_data(json!({ "build_id": build_id })),
            PluginError::InvalidInput(message) => RpcError::invalid_params(message),
            PluginError::Internal(e) => {
                RpcError::internal(e.to_string()).with_data(format!("{e:#}"))
            }
        }
    }
}

/// Actions in the `project` namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectAction {
    GetDetails,
    SetPackages,
    GetPackages,
    SetBootloader,
    GetBootloader,
    SetHostname,
    GetHostname,
    BuildIso,
    StreamBuildOutput,
    GetBuildStatus,
    CancelBuild,
}

impl ProjectAction {
    fn parse(action: &str) -> Option<Self> {
        Some(match action {
            "getDetails" => Self::GetDetails,
            "setPackages" => Self::SetPackages,
            "getPackages" => Self::GetPackages,
            "setBootloader" => Self::SetBootloader,
            "getBootloader" => Self::GetBootloader,
            "setHostname" => Self::SetHostname,
            "getHostname" => Self::GetHostname,
            "buildIso" => Self::BuildIso,
            "streamBuildOutput" => Self::StreamBuildOutput,
            "getBuildStatus" => Self::GetBuildStatus,
            "cancelBuild" => Self::CancelBuild,
            _ => return None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreateProjectParams {
    #[serde(default)]
    distro_id: Option<String>,
    #[serde(flatten)]
    options: CreateParams,
}

#[derive(Debug, Deserialize)]
struct PackagesParams {
    packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BootloaderParams {
    bootloader: String,
}

#[derive(Debug, Deserialize)]
struct HostnameParams {
    hostname: String,
}

/// Result of handling one request: the response, plus a log stream to start
/// once that response has been written.
pub struct Dispatched {
    pub response: Response,
    pub stream: Option<StreamTask>,
}

impl Dispatched {
    fn reply(response: Response) -> Self {
        Self {
            response,
            stream: None,
        }
    }
}

type ActionResult = Result<(Value, Option<StreamTask>), RpcError>;

pub struct Dispatcher {
    plugins: PluginRegistry,
    projects: ProjectRegistry,
    output: OutputSink,
}

impl Dispatcher {
    pub fn new(plugins: PluginRegistry, output: OutputSink) -> Self {
        Self {
            plugins,
            projects: ProjectRegistry::new(),
            output,
        }
    }

    pub fn projects(&self) -> &ProjectRegistry {
        &self.projects
    }

    pub fn output(&self) -> &OutputSink {
        &self.output
    }

    /// Handle one raw input line: parse, dispatch, write the response and
    /// start any log stream the request asked for.
    ///
    /// Errors only when the output channel itself has failed.
    pub fn serve_line(&self, line: &str) -> anyhow::Result<()> {
        let dispatched = match Request::parse(line) {
            Ok(request) => self.dispatch(&request),
            Err(rejected) => {
                debug!(code = rejected.error.code, "rejected input line");
                Dispatched::reply(rejected.into_response())
            }
        };

        self.output.send(&dispatched.response)?;

        if let Some(task) = dispatched.stream {
            let (project_id, build_id) = (task.project_id.clone(), task.build_id.clone());
            let plugin = Arc::clone(&task.plugin);
            if let Err(e) = task.spawn(self.output.clone()) {
                error!(%project_id, %build_id, error = ?e, "could not start log stream");
                // The ack is already out; close the stream for the client.
                send_stream_end(
                    &self.output,
                    plugin.as_ref(),
                    &project_id,
                    &build_id,
                    Some(&format!("{e:#}")),
                );
            }
        }
        Ok(())
    }

    /// Route a validated request. Never fails; every error becomes an error
    /// response.
    pub fn dispatch(&self, request: &Request) -> Dispatched {
        let _span = request_span(&request.method, &request.id).entered();
        let id = request.id.clone();
        let routed = request
            .method_name()
            .and_then(|method| self.route(method, &request.params));

        match routed {
            Ok((result, stream)) => Dispatched {
                response: Response::success(id, result),
                stream,
            },
            Err(err) => {
                debug!(method = %request.method, code = err.code, message = %err.message, "request failed");
                Dispatched::reply(Response::failure(id, err))
            }
        }
    }

    fn route(&self, method: MethodName<'_>, params: &Value) -> ActionResult {
        match method.namespace {
            "engine" => self.engine_action(method.action, params),
            "project" => self.project_action(method.action, params),
            other => Err(RpcError::method_not_found(format!(
                "Namespace '{other}' not found"
            ))),
        }
    }

    fn engine_action(&self, action: &str, params: &Value) -> ActionResult {
        let result = match action {
            "getDistroPlugins" => json!({ "distros": self.plugins.list() }),
            "createProject" => self.create_project(params)?,
            "ping" => json!({ "version": env!("CARGO_PKG_VERSION") }),
            other => {
                return Err(RpcError::method_not_found(format!(
                    "Method '{other}' not found in engine namespace"
                )))
            }
        };
        Ok((result, None))
    }

    fn create_project(&self, params: &Value) -> Result<Value, RpcError> {
        let params: CreateProjectParams = parse_params(params, "createProject")?;
        let distro_id = match params.distro_id {
            Some(distro_id) if !distro_id.is_empty() => distro_id,
            _ => return Err(RpcError::invalid_params("Missing distro_id")),
        };

        let plugin = self
            .plugins
            .get(&distro_id)
            .ok_or_else(|| RpcError::plugin_not_found(&distro_id))?;

        let project_id = self.projects.allocate_id();
        if let Err(e) = plugin.initialize_project(&project_id, &params.options) {
            warn!(%project_id, %distro_id, error = %e, "project initialization failed");
            return Err(match e {
                PluginError::Internal(e) => {
                    RpcError::internal(format!("Error creating project with plugin: {e}"))
                        .with_data(format!("{e:#}"))
                }
                other => other.into(),
            });
        }

        self.projects.insert(ProjectRecord {
            id: project_id.clone(),
            distro_id: distro_id.clone(),
        });
        info!(%project_id, %distro_id, "project created");
        Ok(json!({ "project_id": project_id }))
    }

    fn project_action(&self, action: &str, params: &Value) -> ActionResult {
        let action = ProjectAction::parse(action).ok_or_else(|| {
            RpcError::method_not_found(format!(
                "Method '{action}' not found in project namespace"
            ))
        })?;

        let project_id = required_str(params, "project_id")?;
        let project = self
            .projects
            .get(project_id)
            .ok_or_else(|| RpcError::project_not_found(project_id))?;
        let plugin = self.plugins.get(&project.distro_id).ok_or_else(|| {
            RpcError::new(
                PLUGIN_NOT_FOUND,
                format!(
                    "Plugin '{}' for project '{}' not found",
                    project.distro_id, project_id
                ),
            )
        })?;

        debug!(project_id, ?action, distro_id = %project.distro_id, "project action");

        let result = match action {
            ProjectAction::GetDetails => to_value(&plugin.get_configuration(project_id)?)?,
            ProjectAction::SetPackages => {
                let p: PackagesParams = parse_params(params, "setPackages")?;
                plugin.set_packages(project_id, &p.packages)?;
                success()
            }
            ProjectAction::GetPackages => {
                json!({ "packages": plugin.get_packages(project_id)? })
            }
            ProjectAction::SetBootloader => {
                let p: BootloaderParams = parse_params(params, "setBootloader")?;
                plugin.set_bootloader(project_id, &p.bootloader)?;
                success()
            }
            ProjectAction::GetBootloader => {
                json!({ "bootloader": plugin.get_bootloader(project_id)? })
            }
            ProjectAction::SetHostname => {
                let p: HostnameParams = parse_params(params, "setHostname")?;
                plugin.set_hostname(project_id, &p.hostname)?;
                success()
            }
            ProjectAction::GetHostname => {
                json!({ "hostname": plugin.get_hostname(project_id)? })
            }
            ProjectAction::BuildIso => {
                let ticket = plugin.start_build(project_id)?;
                info!(project_id, build_id = %ticket.build_id, "build started");
                to_value(&ticket)?
            }
            ProjectAction::StreamBuildOutput => {
                return self.stream_build_output(plugin, project_id, params);
            }
            ProjectAction::GetBuildStatus => {
                let build_id = required_str(params, "build_id")?;
                to_value(&plugin.get_build_status(project_id, build_id)?)?
            }
            ProjectAction::CancelBuild => {
                let build_id = required_str(params, "build_id")?;
                let snapshot = plugin.cancel_build(project_id, build_id)?;
                info!(project_id, build_id, status = %snapshot.status, "build cancellation requested");
                to_value(&snapshot)?
            }
        };
        Ok((result, None))
    }

    fn stream_build_output(
        &self,
        plugin: Arc<dyn DistroPlugin>,
        project_id: &str,
        params: &Value,
    ) -> ActionResult {
        let build_id = required_str(params, "build_id")?;
        let stream = plugin.stream_build_output(project_id, build_id)?;

        let ack = json!({
            "message": "Streaming initiated. Log lines will be sent as separate JSON objects.",
            "project_id": project_id,
            "build_id": build_id,
        });
        let task = StreamTask {
            project_id: project_id.to_string(),
            build_id: build_id.to_string(),
            plugin,
            stream,
        };
        Ok((ack, Some(task)))
    }
}

fn success() -> Value {
    json!({ "success": true })
}

/// A non-empty string member of the params object.
fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    match params.get(key) {
        None | Some(Value::Null) => Err(RpcError::invalid_params(format!(
            "Missing {key} in params"
        ))),
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        Some(_) => Err(RpcError::invalid_params(format!("Invalid or empty {key}"))),
    }
}

fn parse_params<T: DeserializeOwned>(params: &Value, method: &str) -> Result<T, RpcError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|e| {
        RpcError::invalid_params(format!("Invalid params for {method}")).with_data(e.to_string())
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| {
        RpcError::internal("Internal error encoding result").with_data(e.to_string())
    })
}
