//! Locating, and if needed downloading, the browser executable.
//!
//! Resolution happens at most once per fetcher. Concurrent first callers
//! share a single download; later callers get the cached path.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::BrowserConfig;
use crate::error::{ForgeError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// Where the executable comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum BinarySource {
    /// A configured path, used as-is.
    Explicit(PathBuf),
    /// A pinned Chrome for Testing headless shell, cached on disk.
    Download(DownloadSpec),
    /// Whatever browser the engine finds on the system.
    System,
}

/// A pinned headless-shell download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSpec {
    pub version: String,
    pub base_url: String,
    /// Chrome for Testing platform key, e.g. `linux64`.
    pub platform: String,
    pub cache_dir: PathBuf,
}

impl DownloadSpec {
    pub fn archive_url(&self) -> String {
        format!(
            "{}/{}/{}/chrome-headless-shell-{}.zip",
            self.base_url.trim_end_matches('/'),
            self.version,
            self.platform,
            self.platform
        )
    }

    /// Directory the archive is unpacked into.
    pub fn install_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.version).join(&self.platform)
    }

    pub fn executable_path(&self) -> PathBuf {
        let name = if self.platform.starts_with("win") {
            "chrome-headless-shell.exe"
        } else {
            "chrome-headless-shell"
        };
        self.install_dir()
            .join(format!("chrome-headless-shell-{}", self.platform))
            .join(name)
    }
}

/// Platform key for the running host, if Chrome for Testing publishes one.
pub fn host_platform() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Some("linux64"),
        ("macos", "x86_64") => Some("mac-x64"),
        ("macos", "aarch64") => Some("mac-arm64"),
        ("windows", "x86_64") => Some("win64"),
        ("windows", "x86") => Some("win32"),
        _ => None,
    }
}

/// Resolves the browser executable once and caches the answer.
#[derive(Debug)]
pub struct BinaryFetcher {
    source: BinarySource,
    resolved: OnceCell<Option<PathBuf>>,
}

impl BinaryFetcher {
    pub fn new(source: BinarySource) -> Self {
        Self {
            source,
            resolved: OnceCell::new(),
        }
    }

    /// Pick the source from configuration: explicit path, else download, else system.
    pub fn from_config(config: &BrowserConfig) -> Self {
        if let Some(path) = &config.executable {
            return Self::new(BinarySource::Explicit(path.clone()));
        }
        if !config.download {
            return Self::new(BinarySource::System);
        }
        let Some(platform) = host_platform() else {
            log::warn!(
                "no headless shell build for {}/{}; falling back to the system browser",
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            return Self::new(BinarySource::System);
        };
        let cache_dir = config.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("report-forge")
                .join("browsers")
        });
        Self::new(BinarySource::Download(DownloadSpec {
            version: config.version.clone(),
            base_url: config.download_base_url.clone(),
            platform: platform.to_string(),
            cache_dir,
        }))
    }

    pub fn source(&self) -> &BinarySource {
        &self.source
    }

    /// The executable to launch; `None` means let the engine find one.
    ///
    /// Fails with [`ForgeError::BrowserUnavailable`] when the binary cannot be
    /// found or fetched, or [`ForgeError::Cancelled`] if `cancel` fires first.
    pub async fn executable(&self, cancel: &CancellationToken) -> Result<Option<PathBuf>> {
        let resolved = self
            .resolved
            .get_or_try_init(|| self.resolve(cancel))
            .await?;
        Ok(resolved.clone())
    }

    async fn resolve(&self, cancel: &CancellationToken) -> Result<Option<PathBuf>> {
        match &self.source {
            BinarySource::Explicit(path) => {
                if path.is_file() {
                    Ok(Some(path.clone()))
                } else {
                    Err(ForgeError::BrowserUnavailable(format!(
                        "configured browser {} does not exist",
                        path.display()
                    )))
                }
            }
            BinarySource::System => Ok(None),
            BinarySource::Download(spec) => {
                let exe = spec.executable_path();
                if exe.is_file() {
                    log::debug!("using cached headless shell at {}", exe.display());
                    return Ok(Some(exe));
                }
                let spec = spec.clone();
                let token = cancel.clone();
                let task = tokio::task::spawn_blocking(move || install(&spec, &token));
                tokio::select! {
                    joined = task => joined
                        .map_err(|e| ForgeError::BrowserUnavailable(format!("download task failed: {e}")))?
                        .map(Some),
                    // The blocking loop sees the same token and stops on its own.
                    _ = cancel.cancelled() => Err(ForgeError::Cancelled),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Download + install (blocking)
// ---------------------------------------------------------------------------

fn install(spec: &DownloadSpec, cancel: &CancellationToken) -> Result<PathBuf> {
    let unavailable = |what: &str, e: &dyn std::fmt::Display| {
        ForgeError::BrowserUnavailable(format!("{what}: {e}"))
    };

    fs::create_dir_all(&spec.cache_dir)
        .map_err(|e| unavailable(&format!("creating {}", spec.cache_dir.display()), &e))?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(&spec.cache_dir)
        .map_err(|e| unavailable("creating staging directory", &e))?;

    let url = spec.archive_url();
    log::info!("downloading headless shell {} from {url}", spec.version);
    let archive_path = staging.path().join("archive.zip");
    let bytes = download(&url, &archive_path, cancel)?;
    log::debug!("downloaded {bytes} bytes");

    let unpacked = staging.path().join("unpacked");
    let archive = File::open(&archive_path).map_err(|e| unavailable("opening archive", &e))?;
    zip::ZipArchive::new(archive)
        .and_then(|mut zip| zip.extract(&unpacked))
        .map_err(|e| unavailable("extracting archive", &e))?;

    let install_dir = spec.install_dir();
    if let Some(parent) = install_dir.parent() {
        fs::create_dir_all(parent).map_err(|e| unavailable("creating install directory", &e))?;
    }
    if let Err(e) = fs::rename(&unpacked, &install_dir) {
        // Another process may have finished the same install first.
        if !spec.executable_path().is_file() {
            return Err(unavailable(&format!("installing to {}", install_dir.display()), &e));
        }
        log::debug!("install raced with another process; using its copy");
    }

    let exe = spec.executable_path();
    if !exe.is_file() {
        return Err(ForgeError::BrowserUnavailable(format!(
            "archive did not contain {}",
            exe.display()
        )));
    }
    make_executable(&exe).map_err(|e| unavailable("marking executable", &e))?;
    log::info!("installed headless shell at {}", exe.display());
    Ok(exe)
}

fn download(url: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
    let response = ureq::get(url)
        .call()
        .map_err(|e| ForgeError::BrowserUnavailable(format!("GET {url}: {e}")))?;
    let mut reader = response.into_reader();
    let mut file = File::create(dest)?;
    copy_cancellable(&mut reader, &mut file, cancel)
}

/// Copy `reader` into `writer` in chunks, stopping when `cancel` fires.
fn copy_cancellable<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ForgeError::BrowserUnavailable(format!("download interrupted: {e}"))),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
