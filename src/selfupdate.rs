//! Replaces the running executable with the latest release build.
//!
//! The new image is staged as `<exe>.new`, the current one parked as
//! `<exe>.old`, and the staged file renamed onto the canonical path. If that
//! last rename fails the parked image is moved back, so the canonical path
//! always holds a runnable binary.

use crate::context::{EnvSnapshot, ARCH_OVERRIDE_ENV, OS_OVERRIDE_ENV};
use crate::error::{GodoError, Result};
use crate::fsutil::set_mode;
use crate::net::{download_client, open_download};
use crate::process::{args, CommandRunner};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_RELEASE_BASE_URL: &str = "https://github.com/yejune/do/releases/latest/download";
const BREW_FORMULA: &str = "yejune/tap/godo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// `GODO_OS` / `GODO_ARCH` win over the host values passed in.
    pub fn resolve(env: &EnvSnapshot, host_os: &str, host_arch: &str) -> Result<Self> {
        let os = match env.get(OS_OVERRIDE_ENV) {
            Some(value) => value.to_lowercase(),
            None => match host_os {
                "macos" => "darwin".to_string(),
                "linux" => "linux".to_string(),
                "windows" => "windows".to_string(),
                value => {
                    return Err(GodoError::precondition(
                        format!("unsupported operating system for self-update: {value}"),
                        format!("Set {OS_OVERRIDE_ENV} to darwin, linux or windows"),
                    ))
                }
            },
        };
        let arch = match env.get(ARCH_OVERRIDE_ENV) {
            Some(value) => value.to_lowercase(),
            None => match host_arch {
                "x86_64" => "amd64".to_string(),
                "aarch64" => "arm64".to_string(),
                value => {
                    return Err(GodoError::precondition(
                        format!("unsupported architecture for self-update: {value}"),
                        format!("Set {ARCH_OVERRIDE_ENV} to amd64 or arm64"),
                    ))
                }
            },
        };
        Ok(Self { os, arch })
    }

    pub fn artifact_name(&self) -> String {
        let mut name = format!("godo-{}-{}", self.os, self.arch);
        if self.os == "windows" {
            name.push_str(".exe");
        }
        name
    }

    pub fn download_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.artifact_name())
    }
}

/// The `.new` / `.old` slots beside the canonical executable path.
#[derive(Debug, Clone)]
pub struct ImageSlots {
    pub canonical: PathBuf,
    pub staged: PathBuf,
    pub backup: PathBuf,
}

impl ImageSlots {
    pub fn for_executable(exe: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = exe.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            canonical: exe.to_path_buf(),
            staged: with_suffix(".new"),
            backup: with_suffix(".old"),
        }
    }

    /// Writes the downloaded image into the `.new` slot as an executable.
    pub fn stage<R: Read>(&self, mut image: R) -> Result<u64> {
        let written = (|| -> io::Result<u64> {
            let mut file = fs::File::create(&self.staged)?;
            let written = io::copy(&mut image, &mut file)?;
            file.sync_all()?;
            set_mode(&self.staged, 0o755)?;
            Ok(written)
        })();
        match written {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                let _ = fs::remove_file(&self.staged);
                Err(GodoError::Process(format!(
                    "failed to write {}: {err}",
                    self.staged.display()
                )))
            }
        }
    }

    pub fn swap(&self) -> Result<()> {
        self.swap_with(|from, to| fs::rename(from, to))
    }

    /// Swap using `rename`; exposed so the failure paths can be driven directly.
    pub fn swap_with<F>(&self, rename: F) -> Result<()>
    where
        F: Fn(&Path, &Path) -> io::Result<()>,
    {
        match fs::remove_file(&self.backup) {
            Ok(()) => debug!(path = %self.backup.display(), "removed stale backup"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(&self.staged);
                return Err(GodoError::Process(format!(
                    "failed to remove stale backup {}: {err}",
                    self.backup.display()
                )));
            }
        }

        if let Err(err) = rename(&self.canonical, &self.backup) {
            let _ = fs::remove_file(&self.staged);
            return Err(GodoError::Process(format!(
                "failed to move current binary aside: {err}"
            )));
        }

        if let Err(err) = rename(&self.staged, &self.canonical) {
            warn!(error = %err, "install rename failed, restoring previous binary");
            let restore = rename(&self.backup, &self.canonical);
            let _ = fs::remove_file(&self.staged);
            return Err(match restore {
                Ok(()) => GodoError::Process(format!(
                    "failed to install new binary (previous version restored): {err}"
                )),
                Err(restore_err) => GodoError::Process(format!(
                    "failed to install new binary: {err}; restoring {} also failed: {restore_err}",
                    self.backup.display()
                )),
            });
        }

        if let Err(err) = fs::remove_file(&self.backup) {
            debug!(error = %err, "could not remove backup after update");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRoute {
    PackageManager,
    Direct { url: String, bytes: u64 },
}

/// Source of release images.
pub trait ImageSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read>>;
}

pub struct HttpImageSource;

impl ImageSource for HttpImageSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read>> {
        let client = download_client()?;
        Ok(Box::new(open_download(&client, url)?))
    }
}

pub struct SelfUpdater<'a, R: CommandRunner, S: ImageSource> {
    runner: &'a R,
    images: &'a S,
    env: &'a EnvSnapshot,
    host: (&'a str, &'a str),
    base_url: String,
    slots: ImageSlots,
}

impl<'a, R: CommandRunner, S: ImageSource> SelfUpdater<'a, R, S> {
    pub fn new(
        runner: &'a R,
        images: &'a S,
        env: &'a EnvSnapshot,
        base_url: Option<&str>,
        exe_path: &Path,
    ) -> Self {
        Self {
            runner,
            images,
            env,
            host: (std::env::consts::OS, std::env::consts::ARCH),
            base_url: base_url.unwrap_or(DEFAULT_RELEASE_BASE_URL).to_string(),
            slots: ImageSlots::for_executable(exe_path),
        }
    }

    pub fn with_host(mut self, os: &'a str, arch: &'a str) -> Self {
        self.host = (os, arch);
        self
    }

    /// Resolved only on the direct path; brew does not need it.
    pub fn platform(&self) -> Result<Platform> {
        Platform::resolve(self.env, self.host.0, self.host.1)
    }

    pub fn update(&self) -> Result<UpdateRoute> {
        if self.try_package_manager() {
            return Ok(UpdateRoute::PackageManager);
        }
        self.update_direct()
    }

    fn try_package_manager(&self) -> bool {
        match self
            .runner
            .run("brew", &args(["upgrade", BREW_FORMULA]), false)
        {
            Ok(output) if output.success() => true,
            Ok(output) => {
                info!(status = output.status_code, "brew upgrade failed, downloading directly");
                false
            }
            Err(err) => {
                info!(error = %err, "brew unavailable, downloading directly");
                false
            }
        }
    }

    pub fn update_direct(&self) -> Result<UpdateRoute> {
        let url = self.platform()?.download_url(&self.base_url);
        info!(%url, "downloading release image");
        let image = self.images.open(&url)?;
        let bytes = self.slots.stage(image)?;
        self.slots.swap()?;
        Ok(UpdateRoute::Direct { url, bytes })
    }
}
