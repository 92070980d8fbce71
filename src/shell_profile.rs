//! Installs the `claude` session-logging wrapper into the user's shell rc file.

use crate::context::{EnvSnapshot, SHELL_ENV};
use crate::error::{GodoError, Result};
use crate::fsutil::{resolve_link_target, write_atomic_text_file_preserving_mode};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BLOCK_MARKER: &str = "# Do - Claude logging";
pub const BLOCK_CLOSER: &str = "fi";

// Inner conditionals stay on one line: a line that is exactly `fi` ends the block.
const LOGGING_BLOCK: &str = r#"# Do - Claude logging
if command -v claude >/dev/null 2>&1; then
  claude() {
    local session_id log_root log_dir log_file claude_bin exit_code
    session_id="$(date +%Y%m%d-%H%M%S)"
    log_root="$(git rev-parse --show-toplevel 2>/dev/null || pwd)"
    log_dir="$log_root/.do/claude-session/$(date +%Y/%m/%d)"
    mkdir -p "$log_dir"
    log_file="$log_dir/$session_id.session"
    claude_bin="$(type -P claude 2>/dev/null || whence -p claude 2>/dev/null)"
    echo "Session: $session_id" >&2
    echo "Claude session started at $(date -u +%Y-%m-%dT%H:%M:%SZ)" >> "$log_file"
    if script --version >/dev/null 2>&1; then CLAUDE_SESSION_ID="$session_id" script -q -e -a -c "$claude_bin $(printf '%q ' "$@")" "$log_file"; else CLAUDE_SESSION_ID="$session_id" script -q -a "$log_file" "$claude_bin" "$@"; fi
    exit_code=$?
    echo "Claude session ended at $(date -u +%Y-%m-%dT%H:%M:%SZ) (exit code: $exit_code)" >> "$log_file"
    return $exit_code
  }
fi"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFamily {
    Zsh,
    Bash,
}

impl ShellFamily {
    pub fn from_env(env: &EnvSnapshot) -> Result<Self> {
        let shell = env.get(SHELL_ENV).unwrap_or("");
        if shell.contains("zsh") {
            Ok(ShellFamily::Zsh)
        } else if shell.contains("bash") {
            Ok(ShellFamily::Bash)
        } else {
            Err(GodoError::precondition(
                format!("unsupported shell: {shell:?}"),
                "Only zsh and bash are supported; set SHELL to one of them",
            ))
        }
    }

    pub fn rc_file(self, home: &Path) -> PathBuf {
        match self {
            ShellFamily::Zsh => home.join(".zshrc"),
            ShellFamily::Bash => home.join(".bashrc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Absent,
    Current,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileChange {
    Appended,
    Unchanged,
    Replaced,
}

#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub shell: ShellFamily,
    pub rc_file: PathBuf,
    pub change: ProfileChange,
}

pub fn logging_block() -> &'static str {
    LOGGING_BLOCK
}

pub fn block_state(content: &str, block: &str) -> BlockState {
    let markers = content
        .lines()
        .filter(|line| line.contains(BLOCK_MARKER))
        .count();
    if markers == 0 {
        BlockState::Absent
    } else if markers == 1 && content.contains(block) {
        BlockState::Current
    } else {
        BlockState::Stale
    }
}

/// Drops every marked block, from the marker line through its closing `fi`.
pub fn remove_block(content: &str) -> String {
    let mut kept = Vec::new();
    let mut skipping = false;
    for line in content.split('\n') {
        if line.contains(BLOCK_MARKER) {
            skipping = true;
            continue;
        }
        if skipping {
            if line.trim() == BLOCK_CLOSER {
                skipping = false;
            }
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

fn append_block(content: &str, block: &str) -> String {
    let base = content.trim_end_matches('\n');
    if base.trim().is_empty() {
        format!("{block}\n")
    } else {
        format!("{base}\n\n{block}\n")
    }
}

/// Returns the rc content with exactly one current block, plus what changed.
pub fn apply_block(content: &str, block: &str) -> (String, ProfileChange) {
    match block_state(content, block) {
        BlockState::Current => (content.to_string(), ProfileChange::Unchanged),
        BlockState::Absent => (append_block(content, block), ProfileChange::Appended),
        BlockState::Stale => {
            let stripped = remove_block(content);
            (append_block(&stripped, block), ProfileChange::Replaced)
        }
    }
}

pub fn install_logging(env: &EnvSnapshot, home: &Path) -> Result<ProfileReport> {
    let shell = ShellFamily::from_env(env)?;
    let rc_file = shell.rc_file(home);
    let change = install_block_into(&rc_file, logging_block())?;
    info!(rc = %rc_file.display(), ?change, "shell profile updated");
    Ok(ProfileReport {
        shell,
        rc_file,
        change,
    })
}

/// Updates the file `rc_file` points at; a symlinked rc stays a symlink.
pub fn install_block_into(rc_file: &Path, block: &str) -> Result<ProfileChange> {
    let rc_file = resolve_link_target(rc_file)?;
    let rc_file = rc_file.as_path();
    let content = match fs::read_to_string(rc_file) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(rc = %rc_file.display(), "rc file missing, creating");
            String::new()
        }
        Err(err) => return Err(err.into()),
    };
    let (updated, change) = apply_block(&content, block);
    if change != ProfileChange::Unchanged {
        write_atomic_text_file_preserving_mode(rc_file, &updated, 0o644)?;
    }
    Ok(change)
}
