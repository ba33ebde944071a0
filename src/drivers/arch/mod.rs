//! Arch Linux build driver.
//!
//! Each project is an mkarchiso profile on disk:
//!
//! ```text
//! <projects_root>/<project_id>/arch_profile/
//!     airootfs/etc/hostname
//!     packages.x86_64
//!     profiledef.sh
//!     pacman.conf
//!     .hostname  .bootloader
//!     build-<n>.log
//! <isos_root>/<project_id>/archlinux-<project_id>-<version>-x86_64.iso
//! <work_root>/<project_id>/
//! ```
//!
//! The profile directory is the source of truth for configuration; only
//! build status lives in memory.

pub mod profile;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use self::profile::{Bootloader, DEFAULT_PACKAGES, PACMAN_CONF};
use crate::build::supervisor::{self, ArtifactSpec, BuildJob};
use crate::build::tail::{LogStream, LogTail};
use crate::build::{BuildOutcome, BuildSnapshot, BuildState, BuildTable};
use crate::drivers::{validate_hostname, validate_packages};
use crate::plugin::{
    BuildTicket, CreateParams, DistroPlugin, PluginDescriptor, PluginError, PluginResult,
    ProjectConfiguration,
};

pub const DISTRO_ID: &str = "arch";

const PROFILE_DIR: &str = "arch_profile";
const PACKAGES_FILE: &str = "packages.x86_64";
const PROFILEDEF_FILE: &str = "profiledef.sh";
const PACMAN_CONF_FILE: &str = "pacman.conf";
const HOSTNAME_FILE: &str = ".hostname";
const BOOTLOADER_FILE: &str = ".bootloader";

/// Roots the driver keeps its per-project trees under.
#[derive(Debug, Clone)]
pub struct ArchPaths {
    pub projects_root: PathBuf,
    pub isos_root: PathBuf,
    pub work_root: PathBuf,
}

/// How builds are run and published.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Program and leading arguments, e.g. `["sudo", "mkarchiso"]`.
    pub tool: Vec<String>,
    pub log_poll_interval: Duration,
    pub download_base: String,
}

pub struct ArchDriver {
    paths: ArchPaths,
    settings: BuildSettings,
    builds: BuildTable,
}

impl ArchDriver {
    /// Create the driver, creating its root directories.
    ///
    /// Failing here is a startup error.
    pub fn new(paths: ArchPaths, settings: BuildSettings) -> Result<Self> {
        for dir in [&paths.projects_root, &paths.isos_root, &paths.work_root] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating arch driver directory '{}'", dir.display()))?;
        }
        anyhow::ensure!(
            !settings.tool.is_empty(),
            "arch driver build tool command must not be empty"
        );

        info!(
            projects_root = %paths.projects_root.display(),
            isos_root = %paths.isos_root.display(),
            work_root = %paths.work_root.display(),
            "arch driver initialized"
        );
        Ok(Self {
            paths,
            settings,
            builds: BuildTable::new(),
        })
    }

    fn profile_dir(&self, project_id: &str) -> PathBuf {
        self.paths.projects_root.join(project_id).join(PROFILE_DIR)
    }

    fn iso_dir(&self, project_id: &str) -> PathBuf {
        self.paths.isos_root.join(project_id)
    }

    fn work_dir(&self, project_id: &str) -> PathBuf {
        self.paths.work_root.join(project_id)
    }

    /// Profile directory of an existing project.
    fn require_project(&self, project_id: &str) -> PluginResult<PathBuf> {
        let dir = self.profile_dir(project_id);
        if !dir.is_dir() {
            return Err(PluginError::ProjectNotFound(project_id.to_string()));
        }
        Ok(dir)
    }

    fn require_build(&self, project_id: &str, build_id: &str) -> PluginResult<BuildSnapshot> {
        self.builds
            .snapshot(project_id, build_id)
            .ok_or_else(|| PluginError::BuildNotFound {
                project_id: project_id.to_string(),
                build_id: build_id.to_string(),
            })
    }

    fn write_packages(&self, profile: &Path, packages: &[String]) -> Result<()> {
        write_file(
            &profile.join(PACKAGES_FILE),
            &profile::render_packages(packages),
        )
    }

    fn write_bootloader(&self, project_id: &str, profile: &Path, bootloader: Bootloader) -> Result<()> {
        write_file(
            &profile.join(PROFILEDEF_FILE),
            &profile::render_profiledef(project_id, bootloader),
        )?;
        make_executable(&profile.join(PROFILEDEF_FILE))?;
        write_file(&profile.join(BOOTLOADER_FILE), bootloader.as_str())
    }

    fn write_hostname(&self, profile: &Path, hostname: &str) -> Result<()> {
        write_file(&profile.join(HOSTNAME_FILE), hostname)?;
        write_file(
            &profile.join("airootfs/etc/hostname"),
            &format!("{hostname}\n"),
        )
    }

    fn read_bootloader(&self, profile: &Path) -> Result<Bootloader> {
        match read_optional(&profile.join(BOOTLOADER_FILE))? {
            Some(stored) => stored
                .parse::<Bootloader>()
                .with_context(|| format!("stored bootloader choice '{}' is invalid", stored)),
            None => Ok(Bootloader::default()),
        }
    }

    fn build_command(&self, project_id: &str, profile: &Path) -> Command {
        let mut tool = self.settings.tool.iter();
        let mut cmd = Command::new(tool.next().map(String::as_str).unwrap_or("mkarchiso"));
        cmd.args(tool)
            .arg("-v")
            .arg("-w")
            .arg(self.work_dir(project_id))
            .arg("-o")
            .arg(self.iso_dir(project_id))
            .arg(profile);
        cmd
    }
}

impl DistroPlugin for ArchDriver {
    fn describe(&self) -> PluginResult<PluginDescriptor> {
        Ok(PluginDescriptor {
            id: DISTRO_ID.to_string(),
            name: "Arch Linux".to_string(),
            description: "Plugin for building Arch Linux ISOs using mkarchiso.".to_string(),
        })
    }

    fn initialize_project(&self, project_id: &str, params: &CreateParams) -> PluginResult<()> {
        // Validate everything before touching the disk.
        if let Some(packages) = &params.packages {
            validate_packages(packages)?;
        }
        if let Some(hostname) = &params.hostname {
            validate_hostname(hostname)?;
        }
        let bootloader: Bootloader = match &params.bootloader {
            Some(raw) => raw.parse()?,
            None => Bootloader::default(),
        };

        // Ids restart with the process; nothing from an earlier session's
        // project of the same id may leak into this one.
        for dir in [
            self.paths.projects_root.join(project_id),
            self.iso_dir(project_id),
            self.work_dir(project_id),
        ] {
            remove_dir_if_exists(&dir)?;
        }

        let profile = self.profile_dir(project_id);
        let airootfs = profile.join("airootfs");
        fs::create_dir_all(&airootfs)
            .with_context(|| format!("creating project directory '{}'", airootfs.display()))?;

        let packages = params.packages.clone().unwrap_or_else(|| {
            DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect()
        });
        self.write_packages(&profile, &packages)?;
        self.write_bootloader(project_id, &profile, bootloader)?;
        write_file(&profile.join(PACMAN_CONF_FILE), PACMAN_CONF)?;
        if let Some(hostname) = &params.hostname {
            self.write_hostname(&profile, hostname)?;
        }

        debug!(project_id, profile = %profile.display(), "arch profile scaffolded");
        Ok(())
    }

    fn get_configuration(&self, project_id: &str) -> PluginResult<ProjectConfiguration> {
        self.require_project(project_id)?;
        let latest = self.builds.latest(project_id);

        Ok(ProjectConfiguration {
            project_id: project_id.to_string(),
            distro_id: DISTRO_ID.to_string(),
            packages: self.get_packages(project_id)?,
            bootloader: self.get_bootloader(project_id)?,
            hostname: self.get_hostname(project_id)?,
            build_status: latest
                .as_ref()
                .map(|build| build.status.to_string())
                .unwrap_or_else(|| "none".to_string()),
            latest_build_id: latest.map(|build| build.build_id),
        })
    }

    fn set_packages(&self, project_id: &str, packages: &[String]) -> PluginResult<()> {
        let profile = self.require_project(project_id)?;
        validate_packages(packages)?;
        self.write_packages(&profile, packages)?;
        Ok(())
    }

    fn get_packages(&self, project_id: &str) -> PluginResult<Vec<String>> {
        let profile = self.require_project(project_id)?;
        let content = read_optional(&profile.join(PACKAGES_FILE))?.unwrap_or_default();
        Ok(profile::parse_packages(&content))
    }

    fn set_bootloader(&self, project_id: &str, bootloader: &str) -> PluginResult<()> {
        let profile = self.require_project(project_id)?;
        let bootloader: Bootloader = bootloader.parse()?;
        self.write_bootloader(project_id, &profile, bootloader)?;
        info!(project_id, bootloader = %bootloader, "bootloader updated");
        Ok(())
    }

    fn get_bootloader(&self, project_id: &str) -> PluginResult<String> {
        let profile = self.require_project(project_id)?;
        Ok(self.read_bootloader(&profile)?.to_string())
    }

    fn set_hostname(&self, project_id: &str, hostname: &str) -> PluginResult<()> {
        let profile = self.require_project(project_id)?;
        validate_hostname(hostname)?;
        self.write_hostname(&profile, hostname)?;
        Ok(())
    }

    fn get_hostname(&self, project_id: &str) -> PluginResult<String> {
        let profile = self.require_project(project_id)?;
        // airootfs/etc/hostname is what ends up in the image; prefer it.
        for candidate in [profile.join("airootfs/etc/hostname"), profile.join(HOSTNAME_FILE)] {
            if let Some(content) = read_optional(&candidate)? {
                return Ok(content);
            }
        }
        Ok(String::new())
    }

    fn start_build(&self, project_id: &str) -> PluginResult<BuildTicket> {
        let profile = self.require_project(project_id)?;
        fs::create_dir_all(self.work_dir(project_id)).with_context(|| {
            format!(
                "creating build directory '{}'",
                self.work_dir(project_id).display()
            )
        })?;

        let started = self
            .builds
            .begin(project_id, |build_id| profile.join(format!("{build_id}.log")))?;

        // Only an image written by this build may complete it.
        if let Err(e) = reset_dir(&self.iso_dir(project_id)) {
            self.builds.finish(
                project_id,
                &started.build_id,
                BuildOutcome::Failed(format!("{e:#}")),
            );
            return Err(PluginError::Internal(e));
        }

        let job = BuildJob {
            project_id: project_id.to_string(),
            build_id: started.build_id.clone(),
            command: self.build_command(project_id, &profile),
            log_path: started.log_path.clone(),
            artifact: ArtifactSpec {
                dir: self.iso_dir(project_id),
                prefix: format!("{}-", profile::iso_name(project_id)),
                suffix: ".iso".to_string(),
                download_base: self.settings.download_base.clone(),
            },
            cancel: started.cancel.clone(),
        };

        if let Err(e) = supervisor::launch(&self.builds, job) {
            self.builds.finish(
                project_id,
                &started.build_id,
                BuildOutcome::Failed(format!("{e:#}")),
            );
            return Err(PluginError::Internal(e.context("launching mkarchiso")));
        }

        Ok(BuildTicket {
            build_id: started.build_id,
            status: BuildState::Building,
        })
    }

    fn cancel_build(&self, project_id: &str, build_id: &str) -> PluginResult<BuildSnapshot> {
        self.require_project(project_id)?;
        self.builds
            .cancel(project_id, build_id)
            .ok_or_else(|| PluginError::BuildNotFound {
                project_id: project_id.to_string(),
                build_id: build_id.to_string(),
            })
    }

    fn stream_build_output(&self, project_id: &str, build_id: &str) -> PluginResult<LogStream> {
        self.require_project(project_id)?;
        self.require_build(project_id, build_id)?;
        let log_path = self
            .builds
            .log_path(project_id, build_id)
            .ok_or_else(|| PluginError::BuildNotFound {
                project_id: project_id.to_string(),
                build_id: build_id.to_string(),
            })?;

        let builds = self.builds.clone();
        let (project, build) = (project_id.to_string(), build_id.to_string());
        let tail = LogTail::open(
            &log_path,
            move || builds.is_terminal(&project, &build),
            self.settings.log_poll_interval,
        )?;
        Ok(Box::new(tail))
    }

    fn get_build_status(&self, project_id: &str, build_id: &str) -> PluginResult<BuildSnapshot> {
        self.require_project(project_id)?;
        self.require_build(project_id, build_id)
    }
}

/// Overwrite `path`, creating parent directories.
fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing '{}'", dir.display())),
    }
}

/// Empty `dir`, leaving it in place.
fn reset_dir(dir: &Path) -> Result<()> {
    remove_dir_if_exists(dir)?;
    fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))
}

/// Trimmed file content, or `None` if the file does not exist.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading '{}'", path.display())),
    }
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("setting permissions on '{}'", path.display()))?;
    }
    Ok(())
}
