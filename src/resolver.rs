use crate::release::{IndexError, Release, ReleaseIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

pub const LATEST: &str = "latest";
const CHECKSUM_SUFFIX: &str = ".sha256";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}")]
    UnsupportedPlatform(String),
    #[error("release not found: {0}")]
    ReleaseNotFound(String),
    #[error("required asset not found: {0}")]
    AssetNotFound(String),
    #[error("release index error: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
}

pub const SUPPORTED_PLATFORMS: &[Platform] = &[Platform::Linux];
pub const SUPPORTED_ARCHS: &[Arch] = &[Arch::X64, Arch::Arm64];

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
        }
    }
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
        }
    }
}

fn joined<T>(items: &[T], name: fn(&T) -> &'static str) -> String {
    items.iter().map(name).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Target {
    pub platform: Platform,
    pub arch: Arch,
}

impl Target {
    /// Validates a platform/arch pair against the allow-lists.
    ///
    /// Accepts both release naming (`x64`, `arm64`) and Rust target naming
    /// (`x86_64`, `aarch64`).
    pub fn parse(platform: &str, arch: &str) -> Result<Self, ResolveError> {
        let platform = match platform {
            "linux" => Platform::Linux,
            other => {
                return Err(ResolveError::UnsupportedPlatform(format!(
                    "Platform {other} is not supported. Currently supported: {}",
                    joined(SUPPORTED_PLATFORMS, Platform::as_str)
                )))
            }
        };
        let arch = match arch {
            "x64" | "x86_64" | "amd64" => Arch::X64,
            "arm64" | "aarch64" => Arch::Arm64,
            other => {
                return Err(ResolveError::UnsupportedPlatform(format!(
                    "Architecture {other} is not supported. Currently supported: {}",
                    joined(SUPPORTED_ARCHS, Arch::as_str)
                )))
            }
        };
        Ok(Self { platform, arch })
    }

    pub fn host() -> Result<Self, ResolveError> {
        Self::parse(env::consts::OS, env::consts::ARCH)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.platform.as_str(), self.arch.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Tag(String),
}

impl FromStr for VersionSelector {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == LATEST {
            Ok(VersionSelector::Latest)
        } else {
            Ok(VersionSelector::Tag(trimmed.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Cli,
    Daemon,
}

impl Component {
    pub fn binary_name(&self) -> &'static str {
        match self {
            Component::Cli => "orbit",
            Component::Daemon => "orbitd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetLayout {
    /// One `orbit-<tag>-<platform>-<arch>.tar.gz` holding every binary.
    Combined,
    /// One archive per component, named after the component binary.
    #[default]
    Split,
}

impl AssetLayout {
    pub fn expected_assets(&self, tag: &str, target: Target) -> Vec<(Vec<Component>, String)> {
        let name = |prefix: &str| {
            format!(
                "{prefix}-{tag}-{}-{}.tar.gz",
                target.platform.as_str(),
                target.arch.as_str()
            )
        };
        match self {
            AssetLayout::Combined => vec![(
                vec![Component::Cli, Component::Daemon],
                name(Component::Cli.binary_name()),
            )],
            AssetLayout::Split => [Component::Cli, Component::Daemon]
                .into_iter()
                .map(|component| (vec![component], name(component.binary_name())))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetRef {
    pub name: String,
    pub remote_id: u64,
    pub download_locator: String,
    pub size: u64,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub tag: String,
    pub target: Target,
    pub layout: AssetLayout,
    pub assets: Vec<AssetRef>,
    pub checksums: BTreeMap<String, AssetRef>,
}

impl ReleaseDescriptor {
    pub fn asset_names(&self) -> Vec<&str> {
        self.assets.iter().map(|asset| asset.name.as_str()).collect()
    }
}

pub fn resolve(
    index: &dyn ReleaseIndex,
    selector: &VersionSelector,
    platform: &str,
    arch: &str,
    layout: AssetLayout,
) -> Result<ReleaseDescriptor, ResolveError> {
    let target = Target::parse(platform, arch)?;
    resolve_for_target(index, selector, target, layout)
}

pub fn resolve_for_target(
    index: &dyn ReleaseIndex,
    selector: &VersionSelector,
    target: Target,
    layout: AssetLayout,
) -> Result<ReleaseDescriptor, ResolveError> {
    let tag = match selector {
        VersionSelector::Latest => {
            debug!("fetching latest release tag");
            let latest = index.latest_release()?;
            debug!("latest release tag: {}", latest.tag_name);
            latest.tag_name
        }
        VersionSelector::Tag(tag) => tag.clone(),
    };

    debug!("fetching release: {tag}");
    let release = index
        .release_by_tag(&tag)?
        .ok_or_else(|| ResolveError::ReleaseNotFound(tag.clone()))?;
    select_assets(&release, &tag, target, layout)
}

fn select_assets(
    release: &Release,
    tag: &str,
    target: Target,
    layout: AssetLayout,
) -> Result<ReleaseDescriptor, ResolveError> {
    let expected = layout.expected_assets(tag, target);
    debug!(
        "looking for assets: {}",
        expected
            .iter()
            .map(|(_, name)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut assets = Vec::with_capacity(expected.len());
    let mut checksums = BTreeMap::new();
    for (components, name) in expected {
        let Some(found) = release.asset(&name) else {
            return Err(ResolveError::AssetNotFound(name));
        };
        if let Some(sum) = release.asset(&format!("{name}{CHECKSUM_SUFFIX}")) {
            checksums.insert(
                name.clone(),
                AssetRef {
                    name: sum.name.clone(),
                    remote_id: sum.id,
                    download_locator: sum.url.clone(),
                    size: sum.size,
                    components: Vec::new(),
                },
            );
        }
        assets.push(AssetRef {
            name,
            remote_id: found.id,
            download_locator: found.url.clone(),
            size: found.size,
            components,
        });
    }

    Ok(ReleaseDescriptor {
        tag: tag.to_string(),
        target,
        layout,
        assets,
        checksums,
    })
}
