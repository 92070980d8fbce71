//! Bundle installation into a project tree.
//!
//! Framework-owned paths are refreshed on every run. User-owned paths are
//! only written when absent unless `force` is set, and `install.sh` never
//! lands in a project at all. The release archive is streamed straight from
//! the network; any failure there falls back to a shallow git clone.

use crate::error::{GodoError, Result};
use crate::fsutil::{copy_contents, ensure_parent, set_mode};
use crate::net::{download_client, open_download};
use crate::process::{args, CommandRunner};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_RELEASE_URL: &str =
    "https://github.com/yejune/do-focus/releases/latest/download/do-release.tar.gz";
pub const DEFAULT_REPO_URL: &str = "https://github.com/yejune/do-focus.git";

pub const INSTALL_MARKER: &str = ".claude/agents/do";
pub const EXCLUDED_ENTRY: &str = "install.sh";
pub const DEV_SENTINELS: [&str; 2] = ["tobrew.yaml", "cmd/godo/main.go"];

const USER_FILES: [&str; 2] = ["CLAUDE.md", ".claude/settings.json"];
const USER_CONFIG_DIR: &str = ".do/config";
const USER_CONFIG_SENTINEL: &str = ".do/config/sections/language.yaml";
const FRAMEWORK_DIRS: [&str; 6] = ["agents", "skills", "hooks", "commands", "styles", "lib"];
const SEED_TEMPLATES: [(&str, &str); 1] = [(
    ".do/config/sections/user.yaml.example",
    ".do/config/sections/user.yaml",
)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Framework,
    UserOwned,
    Excluded,
}

/// Classifies a bundle-relative path (forward slashes, no leading `./`).
pub fn classify(rel: &str) -> PathClass {
    if rel == EXCLUDED_ENTRY {
        PathClass::Excluded
    } else if USER_FILES.contains(&rel)
        || rel == USER_CONFIG_DIR
        || rel.starts_with(&format!("{USER_CONFIG_DIR}/"))
    {
        PathClass::UserOwned
    } else {
        PathClass::Framework
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    Fresh,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleSource {
    Release,
    GitClone,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractStats {
    pub written: usize,
    pub preserved: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub mode: InstallMode,
    pub source: BundleSource,
    pub written: usize,
    pub preserved: Vec<String>,
    pub seeded: Vec<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstallTarget {
    root: PathBuf,
}

impl InstallTarget {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn is_installed(&self) -> bool {
        self.path(INSTALL_MARKER).exists()
    }

    /// The tool's own source checkout must never be synced into.
    pub fn is_source_checkout(&self) -> bool {
        DEV_SENTINELS.iter().all(|rel| self.path(rel).exists())
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(self.path(".claude"))?;
        fs::create_dir_all(self.path(".do/config/sections"))?;
        Ok(())
    }
}

/// Overwrite decisions for one install run.
///
/// The config subtree counts as present once its language file exists.
/// Sampled once per run, before any file is written.
#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    force: bool,
    config_present: bool,
}

impl WritePolicy {
    pub fn snapshot(target: &InstallTarget, force: bool) -> Self {
        Self {
            force,
            config_present: target.path(USER_CONFIG_SENTINEL).exists(),
        }
    }

    pub fn allows(&self, target: &InstallTarget, rel: &str) -> bool {
        match classify(rel) {
            PathClass::Excluded => false,
            PathClass::Framework => true,
            PathClass::UserOwned if self.force => true,
            PathClass::UserOwned => {
                if rel == USER_CONFIG_DIR || rel.starts_with(&format!("{USER_CONFIG_DIR}/")) {
                    !self.config_present
                } else {
                    !target.path(rel).exists()
                }
            }
        }
    }
}

/// Source of the compressed bundle archive.
pub trait ArchiveSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read>>;
}

pub struct HttpArchiveSource;

impl ArchiveSource for HttpArchiveSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read>> {
        let client = download_client()?;
        Ok(Box::new(open_download(&client, url)?))
    }
}

pub struct BundleInstaller<'a, A: ArchiveSource, R: CommandRunner> {
    archives: &'a A,
    runner: &'a R,
    release_url: String,
    repo_url: String,
}

impl<'a, A: ArchiveSource, R: CommandRunner> BundleInstaller<'a, A, R> {
    pub fn new(archives: &'a A, runner: &'a R) -> Self {
        Self {
            archives,
            runner,
            release_url: DEFAULT_RELEASE_URL.to_string(),
            repo_url: DEFAULT_REPO_URL.to_string(),
        }
    }

    pub fn with_urls(mut self, release_url: Option<&str>, repo_url: Option<&str>) -> Self {
        if let Some(url) = release_url {
            self.release_url = url.to_string();
        }
        if let Some(url) = repo_url {
            self.repo_url = url.to_string();
        }
        self
    }

    pub fn install(&self, target: &InstallTarget, force: bool) -> Result<InstallOutcome> {
        let mode = if target.is_installed() {
            InstallMode::Update
        } else {
            InstallMode::Fresh
        };
        info!(root = %target.root().display(), ?mode, force, "installing bundle");
        let policy = WritePolicy::snapshot(target, force);

        let (source, stats, fallback_reason) = match self.install_from_release(target, policy) {
            Ok(stats) => (BundleSource::Release, stats, None),
            Err(err) => {
                warn!(error = %err, "release archive failed, falling back to git clone");
                let stats = self.install_from_git(target, policy)?;
                (BundleSource::GitClone, stats, Some(err.to_string()))
            }
        };
        let seeded = seed_templates(target)?;

        Ok(InstallOutcome {
            mode,
            source,
            written: stats.written,
            preserved: stats.preserved,
            seeded,
            fallback_reason,
        })
    }

    fn install_from_release(
        &self,
        target: &InstallTarget,
        policy: WritePolicy,
    ) -> Result<ExtractStats> {
        let reader = self.archives.open(&self.release_url)?;
        target.prepare()?;
        extract_archive(reader, target, policy)
    }

    fn install_from_git(&self, target: &InstallTarget, policy: WritePolicy) -> Result<ExtractStats> {
        // Dropping the TempDir removes the clone on every exit path.
        let scratch = tempfile::Builder::new().prefix("godo-install-").tempdir()?;
        let clone_dir = scratch.path().join("do");
        let clone_arg = clone_dir.to_string_lossy().to_string();
        let clone_args = args([
            "clone",
            "--depth",
            "1",
            "--quiet",
            self.repo_url.as_str(),
            clone_arg.as_str(),
        ]);
        let output = self
            .runner
            .run("git", &clone_args, true)
            .map_err(|err| GodoError::Process(format!("git clone failed: {err}")))?;
        if !output.success() {
            return Err(GodoError::Process(format!(
                "git clone failed (exit {}): {}",
                output.status_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        target.prepare()?;
        let stats = copy_from_clone(&clone_dir, target, policy)?;
        chmod_hooks(&target.path(".claude/hooks"));
        Ok(stats)
    }
}

fn normalize_entry_path(path: &Path) -> Result<Option<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            _ => {
                return Err(GodoError::Process(format!(
                    "refusing unsafe archive entry: {}",
                    path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

/// Streams a gzip'd tar into `target` under the ownership rules.
pub fn extract_archive<R: Read>(
    reader: R,
    target: &InstallTarget,
    policy: WritePolicy,
) -> Result<ExtractStats> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut stats = ExtractStats::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(rel) = normalize_entry_path(&entry.path()?)? else {
            continue;
        };
        let entry_type = entry.header().entry_type();
        let dest = target.path(&rel);

        if entry_type.is_dir() {
            if classify(&rel) != PathClass::Excluded {
                fs::create_dir_all(&dest)?;
            }
            continue;
        }
        if !entry_type.is_file() {
            debug!(entry = %rel, "skipping non-regular archive entry");
            continue;
        }
        if !policy.allows(target, &rel) {
            if classify(&rel) == PathClass::UserOwned {
                stats.preserved.push(rel);
            }
            continue;
        }

        ensure_parent(&dest)?;
        let mut file = fs::File::create(&dest)?;
        io::copy(&mut entry, &mut file)?;
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        set_mode(&dest, if mode == 0 { 0o644 } else { mode })?;
        stats.written += 1;
    }
    Ok(stats)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| GodoError::Process(format!("walk outside source tree: {err}")))?;
        let dest = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            ensure_parent(&dest)?;
            fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn copy_from_clone(
    clone_dir: &Path,
    target: &InstallTarget,
    policy: WritePolicy,
) -> Result<ExtractStats> {
    let mut stats = ExtractStats::default();

    for dir in FRAMEWORK_DIRS {
        let src = clone_dir.join(".claude").join(dir);
        if !src.is_dir() {
            continue;
        }
        let dst = target.path(".claude").join(dir);
        if dst.exists() {
            fs::remove_dir_all(&dst)?;
        }
        stats.written += copy_tree(&src, &dst)?;
    }

    for rel in USER_FILES {
        let src = clone_dir.join(rel);
        if !src.is_file() {
            continue;
        }
        if policy.allows(target, rel) {
            copy_contents(&src, &target.path(rel))?;
            stats.written += 1;
        } else {
            stats.preserved.push(rel.to_string());
        }
    }

    let config_src = clone_dir.join(USER_CONFIG_DIR);
    if config_src.is_dir() {
        if policy.allows(target, USER_CONFIG_DIR) {
            stats.written += copy_tree(&config_src, &target.path(USER_CONFIG_DIR))?;
        } else {
            stats.preserved.push(format!("{USER_CONFIG_DIR}/"));
        }
    }
    Ok(stats)
}

/// Best effort: marks hook scripts executable.
fn chmod_hooks(hooks_dir: &Path) {
    for entry in WalkDir::new(hooks_dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_script = path
            .extension()
            .map(|ext| ext == "py" || ext == "sh")
            .unwrap_or(false);
        if entry.file_type().is_file() && is_script {
            if let Err(err) = set_mode(path, 0o755) {
                debug!(path = %path.display(), error = %err, "chmod failed");
            }
        }
    }
}

/// Copies first-run defaults from `*.example` templates; never overwrites.
fn seed_templates(target: &InstallTarget) -> Result<Vec<String>> {
    let mut seeded = Vec::new();
    for (template, real) in SEED_TEMPLATES {
        let template_path = target.path(template);
        let real_path = target.path(real);
        if template_path.is_file() && !real_path.exists() {
            copy_contents(&template_path, &real_path)?;
            seeded.push(real.to_string());
        }
    }
    Ok(seeded)
}
