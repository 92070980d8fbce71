use crate::error::{GodoError, Result};
use dirs::home_dir;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

pub const SHELL_ENV: &str = "SHELL";
pub const TERM_PROGRAM_ENV: &str = "TERM_PROGRAM";
pub const TMUX_ENV: &str = "TMUX";
pub const SCREEN_ENV: &str = "STY";
pub const OS_OVERRIDE_ENV: &str = "GODO_OS";
pub const ARCH_OVERRIDE_ENV: &str = "GODO_ARCH";
pub const HOME_OVERRIDE_ENV: &str = "GODO_HOME";
pub const BUNDLE_URL_ENV: &str = "GODO_BUNDLE_URL";
pub const REPO_URL_ENV: &str = "GODO_REPO_URL";
pub const RELEASE_BASE_URL_ENV: &str = "GODO_RELEASE_BASE_URL";

const CONSULTED_VARS: &[&str] = &[
    SHELL_ENV,
    TERM_PROGRAM_ENV,
    TMUX_ENV,
    SCREEN_ENV,
    OS_OVERRIDE_ENV,
    ARCH_OVERRIDE_ENV,
    HOME_OVERRIDE_ENV,
    BUNDLE_URL_ENV,
    REPO_URL_ENV,
    RELEASE_BASE_URL_ENV,
];

/// Snapshot of the environment variables this tool consults.
///
/// Empty values are treated the same as unset ones.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        let vars = CONSULTED_VARS
            .iter()
            .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Ambient process state, resolved once in `main` and handed to each subsystem.
#[derive(Debug, Clone)]
pub struct Context {
    pub cwd: PathBuf,
    pub home: PathBuf,
    pub exe_path: PathBuf,
    pub env: EnvSnapshot,
}

impl Context {
    pub fn from_process() -> Result<Self> {
        let env = EnvSnapshot::capture();
        let home = home_dir().ok_or_else(|| {
            GodoError::Config(
                "unable to resolve $HOME; set HOME to an existing directory".to_string(),
            )
        })?;
        Ok(Self {
            cwd: env::current_dir()?,
            home,
            exe_path: env::current_exe()?,
            env,
        })
    }

    /// Per-user data root: `$GODO_HOME`, else `~/.do`.
    pub fn global_root(&self) -> PathBuf {
        match self.env.get(HOME_OVERRIDE_ENV) {
            Some(path) => PathBuf::from(path),
            None => self.home.join(".do"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_read_as_unset() {
        let env = EnvSnapshot::from_pairs([(TMUX_ENV, ""), (SCREEN_ENV, "1234.pts-0")]);
        assert_eq!(env.get(TMUX_ENV), None);
        assert!(!env.is_set(TMUX_ENV));
        assert_eq!(env.get(SCREEN_ENV), Some("1234.pts-0"));
    }

    #[test]
    fn global_root_honors_override() {
        let mut ctx = Context {
            cwd: PathBuf::from("/work"),
            home: PathBuf::from("/home/dev"),
            exe_path: PathBuf::from("/usr/local/bin/godo"),
            env: EnvSnapshot::default(),
        };
        assert_eq!(ctx.global_root(), PathBuf::from("/home/dev/.do"));
        ctx.env = EnvSnapshot::from_pairs([(HOME_OVERRIDE_ENV, "/tmp/godo-home")]);
        assert_eq!(ctx.global_root(), PathBuf::from("/tmp/godo-home"));
    }
}
