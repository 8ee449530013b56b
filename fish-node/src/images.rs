//! Layered disk-image download and unpack.
//!
//! Downloads fan out concurrently since images are independent; unpack is
//! sequential in list order so later images overwrite earlier ones.

use crate::runner::{CmdError, CommandInput, CommandRunner};
use futures_util::{StreamExt, future::join_all};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

const UNPACK_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const ARCHIVE_SUFFIXES: &[&str] = &[".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tar.xz"];

/// One layer of an environment image. A list of images is unpacked in the
/// given order into the targets selected by each `tag`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,

    pub version: String,

    /// Where to fetch the image archive from.
    pub url: String,

    /// Expected digest of the downloaded archive as `algo:hex`.
    #[serde(default)]
    pub sum: String,

    /// Disk name to unpack into; empty means the environment's home.
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid image: {0}")]
    Invalid(String),

    #[error("failed to download {url}: {source}")]
    Download { url: String, source: reqwest::Error },

    #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
    DigestMismatch { url: String, expected: String, actual: String },

    #[error("image io: {0}")]
    Io(#[from] io::Error),

    #[error("failed to unpack: {0}")]
    Unpack(#[from] CmdError),

    #[error("image artifact {0} not found")]
    MissingArtifact(String),

    #[error("no archive found inside {0}")]
    MissingArchive(String),

    #[error("image tag '{0}' does not map to any target path")]
    UnknownTag(String),

    #[error("one or more image downloads failed")]
    DownloadBatch,
}

enum SumHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl SumHasher {
    fn parse(sum: &str) -> Result<(Self, String), ImageError> {
        let (algo, expected) = sum
            .split_once(':')
            .ok_or_else(|| ImageError::Invalid(format!("sum '{sum}' is not of the form algo:hex")))?;
        let hasher = match algo {
            "sha256" => Self::Sha256(Sha256::new()),
            "sha512" => Self::Sha512(Sha512::new()),
            other => return Err(ImageError::Invalid(format!("unsupported digest algorithm '{other}'"))),
        };
        Ok((hasher, expected.to_lowercase()))
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Sha512(h) => h.update(bytes),
        }
    }

    fn finalize(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

impl Image {
    pub fn validate(&self) -> Result<(), ImageError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(ImageError::Invalid(format!("bad image name '{}'", self.name)));
        }
        if self.version.is_empty() || self.version.contains('/') {
            return Err(ImageError::Invalid(format!("bad image version '{}'", self.version)));
        }
        if self.url.is_empty() {
            return Err(ImageError::Invalid(format!("image {} has no url", self.name)));
        }
        if !self.sum.is_empty() {
            SumHasher::parse(&self.sum)?;
        }
        Ok(())
    }

    /// Directory under the images path holding the unpacked artifact.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Downloads the image archive, verifies its digest and unpacks it into
    /// the shared images directory. A present artifact directory is reused.
    pub async fn download_unpack(
        &self,
        runner: &dyn CommandRunner,
        tar_path: &Path,
        images_dir: &Path,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<PathBuf, ImageError> {
        let target_dir = images_dir.join(self.dir_name());
        if fs::try_exists(&target_dir).await? {
            debug!("Image {} already unpacked, reusing it", self.dir_name());
            return Ok(target_dir);
        }

        let archive_path = images_dir.join(format!("{}.download", self.dir_name()));
        self.download(&archive_path, user, password).await?;

        // Unpack next to the final location and rename, so a half-unpacked
        // artifact never looks usable.
        let partial_dir = images_dir.join(format!("{}.partial", self.dir_name()));
        if fs::try_exists(&partial_dir).await? {
            fs::remove_dir_all(&partial_dir).await?;
        }
        fs::create_dir_all(&partial_dir).await?;
        let args = vec![
            "-xf".to_string(),
            archive_path.display().to_string(),
            "-C".to_string(),
            partial_dir.display().to_string(),
        ];
        runner.run(UNPACK_TIMEOUT, CommandInput::None, tar_path, &args).await?;
        fs::rename(&partial_dir, &target_dir).await?;
        fs::remove_file(&archive_path).await?;
        info!("Image {} downloaded and unpacked", self.dir_name());
        Ok(target_dir)
    }

    async fn download(
        &self,
        archive_path: &Path,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), ImageError> {
        info!("Downloading {} from {}", self.dir_name(), self.url);
        let mut hasher = match self.sum.is_empty() {
            true => {
                warn!("Image {} carries no checksum, skipping verification", self.dir_name());
                None
            }
            false => Some(SumHasher::parse(&self.sum)?),
        };

        let client = reqwest::Client::new();
        let mut request = client.get(&self.url);
        if let Some(user) = user {
            request = request.basic_auth(user, password);
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| ImageError::Download { url: self.url.clone(), source })?;

        let mut stream = response.bytes_stream();
        let file = fs::File::create(archive_path).await?;
        let mut file = tokio::io::BufWriter::new(file);
        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(|source| ImageError::Download { url: self.url.clone(), source })?;
            if let Some((hasher, _)) = hasher.as_mut() {
                hasher.update(&bytes);
            }
            file.write_all(&bytes).await?;
        }
        file.flush().await?;

        if let Some((hasher, expected)) = hasher {
            let actual = hasher.finalize();
            if actual != expected {
                let _ = fs::remove_file(archive_path).await;
                return Err(ImageError::DigestMismatch { url: self.url.clone(), expected, actual });
            }
        }
        Ok(())
    }
}

/// How to invoke `tar`. The per-allocation unpack goes through the optional
/// escalation prefix (the native driver uses sudo) so the workload user's
/// directories are writable; the inner archive is streamed over stdin so
/// that user never needs read access to the images directory.
#[derive(Clone, Debug)]
pub struct TarInvocation {
    /// The tar binary itself.
    pub tar: PathBuf,

    /// Privilege-escalation program and its arguments, prepended for
    /// unpacks into user-owned directories.
    pub escalate: Option<(PathBuf, Vec<String>)>,
}

impl TarInvocation {
    fn unpack_command(&self, target: &Path) -> (PathBuf, Vec<String>) {
        let tail = ["-xpf".to_string(), "-".to_string(), "-C".to_string(), target.display().to_string()];
        match &self.escalate {
            Some((program, prefix)) => {
                let mut args = prefix.clone();
                args.push(self.tar.display().to_string());
                args.extend(tail);
                (program.clone(), args)
            }
            None => (self.tar.clone(), tail.to_vec()),
        }
    }
}

/// Downloads all images concurrently, then unpacks them sequentially in
/// list order into the paths selected by their tags. `targets` must map the
/// empty tag to the environment's home directory.
pub async fn load_images(
    runner: &dyn CommandRunner,
    tar: &TarInvocation,
    images: &[Image],
    images_dir: &Path,
    targets: &HashMap<String, PathBuf>,
    user: Option<&str>,
    password: Option<&str>,
) -> Result<(), ImageError> {
    // Fan out: downloads are independent. Keep going past individual
    // failures so every started download is joined before we bail.
    let downloads =
        images.iter().map(|image| image.download_unpack(runner, &tar.tar, images_dir, user, password));
    let mut failed = false;
    for (image, result) in images.iter().zip(join_all(downloads).await) {
        if let Err(e) = result {
            warn!("Failed to fetch image {}: {e}", image.dir_name());
            failed = true;
        }
    }
    if failed {
        return Err(ImageError::DownloadBatch);
    }

    // Fan in: strict list order, later archives overwrite earlier files.
    for image in images {
        let artifact_dir = find_artifact_dir(images_dir, &image.dir_name()).await?;
        let archive = find_inner_archive(&artifact_dir).await?;
        let target = targets
            .get(image.tag.as_str())
            .ok_or_else(|| ImageError::UnknownTag(image.tag.clone()))?;
        info!("Unpacking {} into {}", image.dir_name(), target.display());
        let (program, args) = tar.unpack_command(target);
        runner.run(UNPACK_TIMEOUT, CommandInput::File(archive), &program, &args).await?;
    }
    Ok(())
}

/// Finds the unpacked artifact directory, skipping broken symlinks left by
/// older image rotations.
async fn find_artifact_dir(images_dir: &Path, dir_name: &str) -> Result<PathBuf, ImageError> {
    let mut entries = fs::read_dir(images_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy() != dir_name {
            continue;
        }
        let path = entry.path();
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Ok(path),
            Ok(_) => continue,
            Err(e) => {
                warn!("Skipping unreadable image entry {}: {e}", path.display());
                continue;
            }
        }
    }
    Err(ImageError::MissingArtifact(dir_name.to_string()))
}

/// Locates the archive to stream into the environment, the first archive
/// file (lexicographically) inside the artifact directory.
async fn find_inner_archive(artifact_dir: &Path) -> Result<PathBuf, ImageError> {
    let mut archives = Vec::new();
    let mut entries = fs::read_dir(artifact_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            archives.push(entry.path());
        }
    }
    archives.sort();
    archives
        .into_iter()
        .next()
        .ok_or_else(|| ImageError::MissingArchive(artifact_dir.display().to_string()))
}
