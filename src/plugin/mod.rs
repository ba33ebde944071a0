//! The contract every build driver implements.
//!
//! A driver owns everything distro-specific about a project: how it is laid
//! out on disk, how its configuration is stored, which tool builds the image
//! and where that tool leaves it. The engine only ever talks to drivers
//! through [`DistroPlugin`] and holds them as `Arc<dyn DistroPlugin>`, so
//! adding a distro is adding an implementation and one `register` call.
//!
//! # Example
//!
//! ```rust,ignore
//! use distroforge::plugin::{DistroPlugin, PluginRegistry};
//! use std::sync::Arc;
//!
//! let mut plugins = PluginRegistry::new();
//! plugins.register("arch", Arc::new(arch_driver))?;
//! for descriptor in plugins.list() {
//!     println!("{} - {}", descriptor.id, descriptor.name);
//! }
//! ```

pub mod registry;

pub use registry::PluginRegistry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::tail::LogStream;
use crate::build::{BuildSnapshot, BuildState};

/// Static description of a registered driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Optional settings applied right after a project is scaffolded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CreateParams {
    pub packages: Option<Vec<String>>,
    pub hostname: Option<String>,
    pub bootloader: Option<String>,
}

/// Aggregate configuration plus latest build state, for `project.getDetails`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfiguration {
    pub project_id: String,
    pub distro_id: String,
    pub packages: Vec<String>,
    pub bootloader: String,
    pub hostname: String,
    /// Status of the most recent build, or `"none"`.
    pub build_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_build_id: Option<String>,
}

/// Reply to a build start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTicket {
    pub build_id: String,
    pub status: BuildState,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("build '{build_id}' not found for project '{project_id}'")]
    BuildNotFound {
        project_id: String,
        build_id: String,
    },

    #[error("build '{build_id}' is already running for project '{project_id}'")]
    BuildInProgress {
        project_id: String,
        build_id: String,
    },

    /// Rejected input; nothing was changed.
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// A distro build driver.
///
/// Every project-scoped method fails with [`PluginError::ProjectNotFound`]
/// when the driver has no scaffold for `project_id`.
pub trait DistroPlugin: Send + Sync {
    /// Static identity. Must not fail for a driver that constructed cleanly.
    fn describe(&self) -> PluginResult<PluginDescriptor>;

    /// Materialize the project's on-disk scaffold, then apply `params`.
    ///
    /// Safe to retry with the same id: every file is written with overwrite
    /// semantics, so a partial scaffold from a failed call is simply replaced.
    fn initialize_project(&self, project_id: &str, params: &CreateParams) -> PluginResult<()>;

    fn get_configuration(&self, project_id: &str) -> PluginResult<ProjectConfiguration>;

    fn set_packages(&self, project_id: &str, packages: &[String]) -> PluginResult<()>;
    fn get_packages(&self, project_id: &str) -> PluginResult<Vec<String>>;

    fn set_bootloader(&self, project_id: &str, bootloader: &str) -> PluginResult<()>;
    fn get_bootloader(&self, project_id: &str) -> PluginResult<String>;

    fn set_hostname(&self, project_id: &str, hostname: &str) -> PluginResult<()>;
    fn get_hostname(&self, project_id: &str) -> PluginResult<String>;

    /// Validate, schedule the image build in the background and return
    /// without waiting for it.
    ///
    /// Fails with [`PluginError::BuildInProgress`] while the project's
    /// previous build is still running.
    fn start_build(&self, project_id: &str) -> PluginResult<BuildTicket>;

    /// Ask a running build to stop. Terminal builds are returned unchanged.
    fn cancel_build(&self, project_id: &str, build_id: &str) -> PluginResult<BuildSnapshot>;

    /// Log chunks as they appear; the stream ends once the build is terminal.
    fn stream_build_output(&self, project_id: &str, build_id: &str) -> PluginResult<LogStream>;

    fn get_build_status(&self, project_id: &str, build_id: &str) -> PluginResult<BuildSnapshot>;
}
