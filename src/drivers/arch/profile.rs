//! Templates for the mkarchiso profile of one project.

use std::fmt;
use std::str::FromStr;

use crate::plugin::PluginError;

pub const DEFAULT_PACKAGES: &[&str] = &["base", "linux", "xf86-video-vesa"];

/// Boot setup the image is built with. Maps onto mkarchiso `bootmodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bootloader {
    Grub,
    Syslinux,
    SystemdBoot,
    /// syslinux for BIOS, GRUB for UEFI. The stock releng layout.
    #[default]
    GrubSyslinux,
}

impl Bootloader {
    pub const ALL: &'static [Bootloader] = &[
        Bootloader::Grub,
        Bootloader::Syslinux,
        Bootloader::SystemdBoot,
        Bootloader::GrubSyslinux,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Bootloader::Grub => "grub",
            Bootloader::Syslinux => "syslinux",
            Bootloader::SystemdBoot => "systemd-boot",
            Bootloader::GrubSyslinux => "grub/syslinux",
        }
    }

    pub fn bootmodes(self) -> &'static [&'static str] {
        match self {
            Bootloader::Grub => &["uefi-x64.grub.esp", "uefi-x64.grub.eltorito"],
            Bootloader::Syslinux => &["bios.syslinux.mbr", "bios.syslinux.eltorito"],
            Bootloader::SystemdBoot => &[
                "uefi-x64.systemd-boot.esp",
                "uefi-x64.systemd-boot.eltorito",
            ],
            Bootloader::GrubSyslinux => &[
                "bios.syslinux.mbr",
                "bios.syslinux.eltorito",
                "uefi-x64.grub.esp",
                "uefi-x64.grub.eltorito",
            ],
        }
    }
}

impl fmt::Display for Bootloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bootloader {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Bootloader::ALL
            .iter()
            .copied()
            .find(|b| b.as_str() == wanted)
            .ok_or_else(|| {
                let expected = Bootloader::ALL
                    .iter()
                    .map(|b| b.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                PluginError::InvalidInput(format!(
                    "unsupported bootloader '{}'; expected one of: {}",
                    s.escape_debug(),
                    expected
                ))
            })
    }
}

/// Image name stem; mkarchiso appends `-<version>-<arch>.iso`.
pub fn iso_name(project_id: &str) -> String {
    format!("archlinux-{project_id}")
}

/// ISO 9660 volume label: upper case, `[A-Z0-9_]` only.
pub fn iso_label(project_id: &str) -> String {
    let sanitized: String = project_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("ARCH_{sanitized}")
}

pub fn render_profiledef(project_id: &str, bootloader: Bootloader) -> String {
    let bootmodes = bootloader
        .bootmodes()
        .iter()
        .map(|mode| format!("'{mode}'"))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"#!/usr/bin/env bash
# shellcheck disable=SC2034
iso_name="{iso_name}"
iso_label="{iso_label}"
iso_publisher="Arch Linux Custom Build"
iso_application="Arch Linux Live/Rescue Image"
iso_version="$(date +%Y.%m.%d)"
install_dir="arch"
buildmodes=('iso')
bootmodes=({bootmodes})
arch="x86_64"
pacman_conf="pacman.conf"
airootfs_image_type="squashfs"
airootfs_image_tool_options=('-comp' 'xz' '-Xbcj' 'x86' '-b' '1M' '-Xdict-size' '1M')
file_permissions=(
  ["/etc/shadow"]="0:0:400"
  ["/root"]="0:0:750"
)
"#,
        iso_name = iso_name(project_id),
        iso_label = iso_label(project_id),
    )
}

/// Relies on the build host's `/etc/pacman.d/mirrorlist`.
pub const PACMAN_CONF: &str = "[options]
HoldPkg     = pacman glibc
Architecture = auto
SigLevel    = Never

[core]
Include = /etc/pacman.d/mirrorlist

[extra]
Include = /etc/pacman.d/mirrorlist
";

pub fn render_packages(packages: &[String]) -> String {
    let mut content = String::new();
    for package in packages {
        content.push_str(package);
        content.push('\n');
    }
    content
}

pub fn parse_packages(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
