//! The per-user data root (`~/.do`): default config, project registry, the
//! worker fallback install dir and the session transcripts.

use crate::error::Result;
use crate::fsutil::write_atomic_text_file;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_WORKER_PORT: u16 = 3778;
pub const DEFAULT_VIEWER_PORT: u16 = 3777;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    pub version: String,
    pub worker: WorkerSettings,
    pub viewer: ViewerSettings,
    pub database: DatabaseSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    pub port: u16,
    pub auto_start: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ViewerSettings {
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            worker: WorkerSettings::default(),
            viewer: ViewerSettings::default(),
            database: DatabaseSettings::default(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_WORKER_PORT,
            auto_start: true,
        }
    }
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_VIEWER_PORT,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            path: "~/.do/memory.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ProjectRegistry {
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProjectEntry {
    pub path: String,
    pub name: String,
    pub registered_at: i64,
}

#[derive(Debug, Clone)]
pub struct GlobalHome {
    root: PathBuf,
}

impl GlobalHome {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn projects_path(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    /// Creates the directory skeleton and default files; existing files are kept.
    pub fn initialize(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.bin_dir(),
            self.root.join("config"),
            self.root.join("logs"),
        ] {
            fs::create_dir_all(&dir)?;
        }
        let config_path = self.config_path();
        if !config_path.exists() {
            let text = serde_json::to_string_pretty(&GlobalConfig::default())?;
            write_atomic_text_file(&config_path, &text, None)?;
        }
        let projects_path = self.projects_path();
        if !projects_path.exists() {
            write_atomic_text_file(&projects_path, r#"{"projects":[]}"#, None)?;
        }
        Ok(())
    }

    /// Reads `config.json`; a missing file means defaults.
    pub fn load_config(&self) -> Result<GlobalConfig> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(GlobalConfig::default());
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Adds `project` to `projects.json` unless the path is already registered.
    /// Returns whether an entry was added.
    pub fn register_project(&self, project: &Path) -> Result<bool> {
        let path = self.projects_path();
        let text = fs::read_to_string(&path)?;
        let mut registry: ProjectRegistry = serde_json::from_str(&text)?;
        let project_path = project.to_string_lossy().to_string();
        if registry.projects.iter().any(|p| p.path == project_path) {
            debug!(project = %project_path, "project already registered");
            return Ok(false);
        }
        registry.projects.push(ProjectEntry {
            name: project
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| project_path.clone()),
            path: project_path,
            registered_at: Utc::now().timestamp(),
        });
        let text = serde_json::to_string_pretty(&registry)?;
        write_atomic_text_file(&path, &text, None)?;
        Ok(true)
    }
}
