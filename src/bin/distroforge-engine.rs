use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use distroforge::config::{ConfigSources, DataRootLock, EngineConfig};
use distroforge::dispatch::Dispatcher;
use distroforge::drivers::arch::{self, ArchDriver};
use distroforge::output::OutputSink;
use distroforge::plugin::PluginRegistry;
use distroforge::{logging, preflight, server};
use tracing::{info, warn};

fn usage() -> &'static str {
    "Usage:\n  distroforge-engine [--config <path>]\n  distroforge-engine --version\n\nReads JSON-RPC requests from stdin, one per line; writes responses to stdout."
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [] => run(None),
        [flag, path] if flag == "--config" || flag == "-c" => run(Some(PathBuf::from(path))),
        [flag] if flag == "--version" || flag == "-V" => {
            println!("distroforge-engine {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        [flag] if flag == "--help" || flag == "-h" => {
            eprintln!("{}", usage());
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = EngineConfig::load(&ConfigSources::from_env(config_path))
        .context("loading engine configuration")?;
    logging::initialize(&config.logging)?;

    let _lock = DataRootLock::acquire(&config.data_root)?;
    info!(
        data_root = %config.data_root.display(),
        config = ?config.source,
        "engine configuration loaded"
    );

    if let Err(e) = preflight::check_build_tool(&config.build.tool) {
        warn!("{e:#}");
    }
    if let Err(e) = preflight::check_required_tools(preflight::ARCHISO_TOOLS) {
        warn!("{e:#}");
    }

    let arch = ArchDriver::new(config.arch_paths(), config.build_settings())
        .context("initializing arch driver")?;
    let mut plugins = PluginRegistry::new();
    plugins.register(arch::DISTRO_ID, Arc::new(arch))?;
    info!(plugins = ?plugins.ids().collect::<Vec<_>>(), "plugins registered");

    let dispatcher = Dispatcher::new(plugins, OutputSink::stdout());
    let stdin = std::io::stdin();
    server::serve(&dispatcher, stdin.lock())
}
