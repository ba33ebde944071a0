//! Line-delimited JSON-RPC engine that drives pluggable distro ISO builds.
//!
//! A client (typically a UI process) writes one JSON-RPC request per line to
//! the engine's stdin and reads responses and notifications from stdout. The
//! engine keeps a set of projects, each bound to a build driver, and forwards
//! project work to that driver:
//!
//! - **Protocol** - envelope parsing, error codes, method names
//! - **Drivers** - the [`plugin::DistroPlugin`] contract and the Arch driver
//! - **Builds** - status table, background supervision, log tailing
//! - **Output** - one write gate shared by responses and notifications
//!
//! # Architecture
//!
//! ```text
//! stdin ──> server::serve ──> Dispatcher ──┬── engine.*  (PluginRegistry, ProjectRegistry)
//!                                          │
//!                                          └── project.* ──> Arc<dyn DistroPlugin>
//!                                                               │
//!                                       ┌───────────────────────┤
//!                                       │                       │
//!                              build::supervisor          build::tail
//!                            (child process, thread)   (stream thread)
//!                                       │                       │
//!                                   BuildTable                  │
//!                                                               │
//! stdout <── OutputSink <── responses ──────────────── notifications
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use distroforge::dispatch::Dispatcher;
//! use distroforge::output::OutputSink;
//! use distroforge::plugin::PluginRegistry;
//!
//! let mut plugins = PluginRegistry::new();
//! plugins.register("arch", Arc::new(arch_driver))?;
//! let dispatcher = Dispatcher::new(plugins, OutputSink::stdout());
//! distroforge::server::serve(&dispatcher, std::io::stdin().lock())?;
//! ```

pub mod build;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod logging;
pub mod output;
pub mod plugin;
pub mod preflight;
pub mod project;
pub mod protocol;
pub mod server;

pub use build::{BuildSnapshot, BuildState, BuildTable};
pub use dispatch::Dispatcher;
pub use plugin::{DistroPlugin, PluginError, PluginRegistry};
pub use protocol::{Request, Response, RpcError};
