//! Release index abstraction.
//!
//! The resolver and installer only ever talk to a [`ReleaseIndex`]; the
//! GitHub-backed implementation lives in [`crate::github`].

use serde::Deserialize;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("io error while streaming {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("asset {asset} has no download location")]
    NoLocation { asset: String },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// API url of the asset; fetching it requires authorization.
    pub url: String,
}

impl Release {
    pub fn asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadLocator {
    pub url: String,
    /// Whether the request must carry the index credentials. Signed
    /// redirect targets must not receive them.
    pub authorized: bool,
}

pub trait ReleaseIndex {
    fn latest_release(&self) -> Result<Release, IndexError>;

    fn release_by_tag(&self, tag: &str) -> Result<Option<Release>, IndexError>;

    fn authorize_download(&self, asset_id: u64, asset_url: &str)
        -> Result<DownloadLocator, IndexError>;

    /// Streams the bytes behind `locator` into `dest`, returning the byte count.
    fn fetch(&self, locator: &DownloadLocator, dest: &mut dyn Write) -> Result<u64, IndexError>;
}
