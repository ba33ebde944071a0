//! Preflight checks for the build host.
//!
//! The engine can serve every configuration request without the image tool
//! installed, so these checks only warn. They exist so a missing `mkarchiso`
//! shows up in the startup log rather than as a failed build later.
//!
//! # Example
//!
//! ```rust
//! use distroforge::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("mkarchiso") {
//!     println!("archiso not installed");
//! }
//!
//! let tools = &[("mksquashfs", "squashfs-tools"), ("xorriso", "libisoburn")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists in `PATH` (or is a usable path itself).
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools mkarchiso shells out to.
///
/// Each tuple is (command_name, package_name).
pub const ARCHISO_TOOLS: &[(&str, &str)] = &[
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "libisoburn"),
    ("mkfs.fat", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("pacstrap", "arch-install-scripts"),
];

/// Privilege wrappers whose first argument is the real tool.
const PRIVILEGE_WRAPPERS: &[&str] = &["sudo", "doas"];

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and the package providing it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the configured build command, e.g. `["sudo", "mkarchiso"]`.
///
/// A leading privilege wrapper is checked along with the program it runs.
pub fn check_build_tool(tool: &[String]) -> Result<()> {
    let Some(program) = tool.first() else {
        bail!("no build tool configured");
    };

    let mut needed = vec![program.as_str()];
    if PRIVILEGE_WRAPPERS.contains(&program.as_str()) {
        if let Some(wrapped) = tool.get(1) {
            needed.push(wrapped.as_str());
        }
    }

    let missing: Vec<&str> = needed
        .into_iter()
        .filter(|cmd| !command_exists(cmd))
        .collect();
    if !missing.is_empty() {
        bail!(
            "build tool not found in PATH: {} (builds will fail until it is installed)",
            missing.join(", ")
        );
    }
    Ok(())
}
