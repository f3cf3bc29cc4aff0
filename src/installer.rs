use crate::release::{IndexError, ReleaseIndex};
use crate::resolver::{AssetRef, ReleaseDescriptor};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("download of {asset} failed: {source}")]
    Transfer {
        asset: String,
        #[source]
        source: IndexError,
    },
    #[error("download of {asset} is incomplete: expected {expected} bytes, got {actual}")]
    Incomplete {
        asset: String,
        expected: u64,
        actual: u64,
    },
    #[error("checksum mismatch for {asset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },
    #[error("failed to extract {asset}: {message}")]
    Extract { asset: String, message: String },
    #[error("installed files do not include {0}")]
    MissingBinary(String),
}

impl InstallError {
    /// Transfer problems may clear up on another attempt; a corrupt archive
    /// will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InstallError::Transfer { .. } | InstallError::Incomplete { .. }
        )
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallManifest {
    pub install_dir: PathBuf,
    pub files: BTreeMap<PathBuf, bool>,
}

impl InstallManifest {
    pub fn binary(&self, name: &str) -> Option<PathBuf> {
        let path = self.install_dir.join(name);
        self.files.contains_key(&path).then_some(path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

pub fn install(
    index: &dyn ReleaseIndex,
    descriptor: &ReleaseDescriptor,
    install_dir: &Path,
) -> Result<InstallManifest, InstallError> {
    fs::create_dir_all(install_dir).map_err(io_err(install_dir))?;

    let staging = staging_dir();
    fs::create_dir_all(&staging).map_err(io_err(&staging))?;
    let result = (|| -> Result<(), InstallError> {
        for asset in &descriptor.assets {
            debug!("processing {}", asset.name);
            let archive = staging.join(&asset.name);
            download_asset(index, asset, &archive)?;
            if let Some(sum) = descriptor.checksums.get(&asset.name) {
                let sum_path = staging.join(&sum.name);
                download_asset(index, sum, &sum_path)?;
                verify_checksum(&asset.name, &archive, &sum_path)?;
            }
            extract_archive(&asset.name, &archive, install_dir)?;
        }
        Ok(())
    })();
    let _ = fs::remove_dir_all(&staging);
    result?;

    mark_executable(install_dir);
    let manifest = collect_manifest(install_dir)?;
    info!(
        "installed {} ({} files) into {}",
        descriptor.tag,
        manifest.files.len(),
        install_dir.display()
    );
    Ok(manifest)
}

pub fn install_with_retry(
    index: &dyn ReleaseIndex,
    descriptor: &ReleaseDescriptor,
    install_dir: &Path,
    policy: RetryPolicy,
) -> Result<InstallManifest, InstallError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match install(index, descriptor, install_dir) {
            Ok(manifest) => return Ok(manifest),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!("install attempt {attempt}/{attempts} failed: {err}; retrying");
                thread::sleep(policy.backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn staging_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    env::temp_dir().join(format!("orbit-download-{}-{}", std::process::id(), nanos))
}

fn download_asset(
    index: &dyn ReleaseIndex,
    asset: &AssetRef,
    dest: &Path,
) -> Result<(), InstallError> {
    let transfer = |source| InstallError::Transfer {
        asset: asset.name.clone(),
        source,
    };
    let locator = index
        .authorize_download(asset.remote_id, &asset.download_locator)
        .map_err(transfer)?;
    let file = File::create(dest).map_err(io_err(dest))?;
    let mut writer = BufWriter::new(file);
    let written = index.fetch(&locator, &mut writer).map_err(transfer)?;
    writer.flush().map_err(io_err(dest))?;
    if asset.size > 0 && written != asset.size {
        return Err(InstallError::Incomplete {
            asset: asset.name.clone(),
            expected: asset.size,
            actual: written,
        });
    }
    debug!("downloaded {} ({written} bytes)", asset.name);
    Ok(())
}

fn parse_checksum(content: &str) -> Option<String> {
    for raw in content.split_whitespace() {
        let candidate = raw
            .trim_matches(|c: char| !c.is_ascii_hexdigit())
            .to_lowercase();
        if candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(candidate);
        }
    }
    None
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn verify_checksum(asset: &str, archive: &Path, checksum_path: &Path) -> Result<(), InstallError> {
    let content = fs::read_to_string(checksum_path).map_err(io_err(checksum_path))?;
    let Some(expected) = parse_checksum(&content) else {
        return Err(InstallError::ChecksumMismatch {
            asset: asset.to_string(),
            expected: "<unparseable checksum file>".to_string(),
            actual: String::new(),
        });
    };
    let actual = sha256_file(archive).map_err(io_err(archive))?;
    if expected != actual {
        return Err(InstallError::ChecksumMismatch {
            asset: asset.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn normalize_tar_entry_path(raw: &str) -> Option<String> {
    let stripped = raw
        .trim()
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

fn run_tar(asset: &str, cmd: &mut Command) -> Result<Vec<u8>, InstallError> {
    let output = cmd.output().map_err(|err| InstallError::Extract {
        asset: asset.to_string(),
        message: format!("failed to run tar: {err}"),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InstallError::Extract {
            asset: asset.to_string(),
            message: format!("tar exited with {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(output.stdout)
}

fn tar_list_entries(asset: &str, archive: &Path) -> Result<Vec<String>, InstallError> {
    let stdout = run_tar(asset, Command::new("tar").arg("-tzf").arg(archive))?;
    Ok(String::from_utf8_lossy(&stdout)
        .lines()
        .filter_map(normalize_tar_entry_path)
        .collect())
}

fn tar_has_single_top_level_dir(entries: &[String]) -> bool {
    let mut top: Option<&str> = None;
    let mut saw_nested = false;
    for entry in entries {
        let (first, rest) = match entry.split_once('/') {
            Some((first, rest)) => (first, Some(rest)),
            None => (entry.as_str(), None),
        };
        if rest.is_some() {
            saw_nested = true;
        }
        match top {
            None => top = Some(first),
            Some(existing) if existing != first => return false,
            Some(_) => {}
        }
    }
    saw_nested && top.is_some()
}

fn extract_archive(asset: &str, archive: &Path, destination: &Path) -> Result<(), InstallError> {
    let entries = tar_list_entries(asset, archive)?;
    let mut cmd = Command::new("tar");
    cmd.arg("-xzf").arg(archive).arg("-C").arg(destination);
    if tar_has_single_top_level_dir(&entries) {
        cmd.arg("--strip-components=1");
    }
    run_tar(asset, &mut cmd)?;
    debug!("extracted {asset} into {}", destination.display());
    Ok(())
}

fn regular_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            files.extend(regular_files(&entry.path())?);
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

#[cfg(unix)]
fn mark_executable(install_dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let files = match regular_files(install_dir) {
        Ok(files) => files,
        Err(err) => {
            warn!("could not list {}: {err}", install_dir.display());
            return;
        }
    };
    for path in files {
        if let Err(err) = fs::set_permissions(&path, fs::Permissions::from_mode(0o755)) {
            warn!("failed to mark {} executable: {err}", path.display());
        }
    }
}

#[cfg(not(unix))]
fn mark_executable(_install_dir: &Path) {}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        true
    }
}

fn collect_manifest(install_dir: &Path) -> Result<InstallManifest, InstallError> {
    let files = regular_files(install_dir)
        .map_err(io_err(install_dir))?
        .into_iter()
        .map(|path| {
            let executable = is_executable(&path);
            (path, executable)
        })
        .collect();
    Ok(InstallManifest {
        install_dir: install_dir.to_path_buf(),
        files,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::tarball;
    use super::*;
    use crate::resolver::testing::StubIndex;
    use crate::resolver::{resolve, AssetLayout, VersionSelector};
    use std::time::Instant;
    use tempfile::tempdir;

    fn split_index(scratch: &Path) -> StubIndex {
        let cli = tarball(scratch, "orbit-v1.0.0", &[("orbit", "#!/bin/sh\n")]);
        let daemon = tarball(
            scratch,
            "orbitd-v1.0.0",
            &[("orbitd", "#!/bin/sh\n"), ("orbitd.conf", "level=1\n")],
        );
        StubIndex::with_release(
            "v1.0.0",
            &[
                (10, "orbit-v1.0.0-linux-x64.tar.gz", cli),
                (11, "orbitd-v1.0.0-linux-x64.tar.gz", daemon),
            ],
        )
    }

    fn descriptor(index: &StubIndex) -> ReleaseDescriptor {
        resolve(
            index,
            &VersionSelector::Latest,
            "linux",
            "x64",
            AssetLayout::Split,
        )
        .unwrap()
    }

    #[test]
    fn install_merges_components_into_flat_executable_tree() {
        let scratch = tempdir().unwrap();
        let index = split_index(scratch.path());
        let install_dir = scratch.path().join("bin");
        let manifest = install(&index, &descriptor(&index), &install_dir).unwrap();

        let names: Vec<_> = manifest
            .files
            .keys()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["orbit", "orbitd", "orbitd.conf"]);
        assert!(manifest.files.values().all(|executable| *executable));
        assert_eq!(manifest.binary("orbitd"), Some(install_dir.join("orbitd")));
        assert_eq!(*index.fetched.borrow(), vec![10, 11]);
    }

    #[test]
    fn install_twice_is_idempotent() {
        let scratch = tempdir().unwrap();
        let index = split_index(scratch.path());
        let install_dir = scratch.path().join("bin");
        let desc = descriptor(&index);
        let first = install(&index, &desc, &install_dir).unwrap();
        let second = install(&index, &desc, &install_dir).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn failed_asset_is_named_and_leaves_no_files_for_it() {
        let scratch = tempdir().unwrap();
        let mut index = split_index(scratch.path());
        index.failing_assets.push(11);
        let install_dir = scratch.path().join("bin");
        let err = install(&index, &descriptor(&index), &install_dir).unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("orbitd-v1.0.0-linux-x64.tar.gz"));
        assert!(install_dir.join("orbit").exists());
        assert!(!install_dir.join("orbitd").exists());
        assert!(!install_dir.join("orbitd.conf").exists());
    }

    #[test]
    fn truncated_download_is_incomplete() {
        let scratch = tempdir().unwrap();
        let index = split_index(scratch.path());
        let mut desc = descriptor(&index);
        desc.assets[0].size += 10;
        let err = install(&index, &desc, &scratch.path().join("bin")).unwrap_err();
        assert!(matches!(err, InstallError::Incomplete { .. }));
    }

    #[test]
    fn corrupt_archive_is_not_retryable() {
        let scratch = tempdir().unwrap();
        let index = StubIndex::with_release(
            "v1.0.0",
            &[
                (1, "orbit-v1.0.0-linux-x64.tar.gz", b"not a tarball".to_vec()),
                (2, "orbitd-v1.0.0-linux-x64.tar.gz", b"nope".to_vec()),
            ],
        );
        let err = install(&index, &descriptor(&index), &scratch.path().join("bin")).unwrap_err();
        assert!(matches!(err, InstallError::Extract { ref asset, .. } if asset == "orbit-v1.0.0-linux-x64.tar.gz"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn published_checksum_is_verified() {
        let scratch = tempdir().unwrap();
        let archive = tarball(scratch.path(), "", &[("orbit", "bin")]);
        let mut hasher = Sha256::new();
        hasher.update(&archive);
        let good = format!("{:x}  orbit-v1.0.0-linux-x64.tar.gz\n", hasher.finalize());
        let bad = format!("{}  orbit-v1.0.0-linux-x64.tar.gz\n", "0".repeat(64));

        for (sum, ok) in [(good, true), (bad, false)] {
            let index = StubIndex::with_release(
                "v1.0.0",
                &[
                    (1, "orbit-v1.0.0-linux-x64.tar.gz", archive.clone()),
                    (2, "orbit-v1.0.0-linux-x64.tar.gz.sha256", sum.into_bytes()),
                ],
            );
            let desc = resolve(
                &index,
                &VersionSelector::Latest,
                "linux",
                "x64",
                AssetLayout::Combined,
            )
            .unwrap();
            let result = install(&index, &desc, &scratch.path().join("bin"));
            assert_eq!(result.is_ok(), ok);
            if !ok {
                assert!(matches!(
                    result.unwrap_err(),
                    InstallError::ChecksumMismatch { .. }
                ));
            }
        }
    }

    #[test]
    fn retry_stops_on_non_retryable_errors() {
        let scratch = tempdir().unwrap();
        let index = StubIndex::with_release(
            "v1.0.0",
            &[
                (1, "orbit-v1.0.0-linux-x64.tar.gz", b"garbage".to_vec()),
                (2, "orbitd-v1.0.0-linux-x64.tar.gz", b"garbage".to_vec()),
            ],
        );
        let desc = descriptor(&index);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let _ = install_with_retry(&index, &desc, &scratch.path().join("bin"), policy);
        assert_eq!(*index.fetched.borrow(), vec![1]);
    }

    #[test]
    fn retry_repeats_transfer_failures_up_to_the_limit() {
        let scratch = tempdir().unwrap();
        let mut index = split_index(scratch.path());
        index.failing_assets.push(10);
        let desc = descriptor(&index);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let err = install_with_retry(&index, &desc, &scratch.path().join("bin"), policy)
            .unwrap_err();
        assert!(matches!(err, InstallError::Transfer { .. }));
        assert_eq!(*index.fetched.borrow(), vec![10, 10, 10]);
    }

    #[test]
    fn retry_waits_the_same_backoff_between_attempts() {
        let scratch = tempdir().unwrap();
        let mut index = split_index(scratch.path());
        index.failing_assets.push(10);
        let desc = descriptor(&index);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(200),
        };
        let started = Instant::now();
        let _ = install_with_retry(&index, &desc, &scratch.path().join("bin"), policy);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    }

    #[test]
    fn single_top_level_detection() {
        let nested = vec!["pkg".to_string(), "pkg/orbit".to_string()];
        assert!(tar_has_single_top_level_dir(&nested));
        let flat = vec!["orbit".to_string(), "orbitd".to_string()];
        assert!(!tar_has_single_top_level_dir(&flat));
        let mixed = vec!["a/orbit".to_string(), "b/orbitd".to_string()];
        assert!(!tar_has_single_top_level_dir(&mixed));
    }

    #[test]
    fn checksum_parsing_accepts_sha256sum_format() {
        let digest = "a".repeat(64);
        assert_eq!(
            parse_checksum(&format!("{digest}  file.tar.gz")),
            Some(digest.clone())
        );
        assert_eq!(parse_checksum("nothing here"), None);
    }
}
