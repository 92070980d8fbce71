use crate::context::{EnvSnapshot, SCREEN_ENV, TERM_PROGRAM_ENV, TMUX_ENV};
use std::fmt;

/// The terminal program (or multiplexer) hosting this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Unknown,
    ITerm2,
    AppleTerminal,
    VsCode,
    Cursor,
    Antigravity,
    Tmux,
    Screen,
}

pub const SUPPORTED_TERMINALS: &str =
    "iTerm2, Terminal.app, tmux, screen, VSCode, Cursor, Antigravity";

impl TerminalKind {
    /// Multiplexer markers win over `TERM_PROGRAM`: an IDE terminal running
    /// tmux still reports the IDE there.
    pub fn detect(env: &EnvSnapshot) -> Self {
        if env.is_set(TMUX_ENV) {
            return TerminalKind::Tmux;
        }
        if env.is_set(SCREEN_ENV) {
            return TerminalKind::Screen;
        }
        match env.get(TERM_PROGRAM_ENV) {
            Some("iTerm.app") => TerminalKind::ITerm2,
            Some("Apple_Terminal") => TerminalKind::AppleTerminal,
            Some("vscode") => TerminalKind::VsCode,
            Some("cursor") => TerminalKind::Cursor,
            Some("antigravity") => TerminalKind::Antigravity,
            _ => TerminalKind::Unknown,
        }
    }

    pub fn is_ide(self) -> bool {
        matches!(
            self,
            TerminalKind::VsCode | TerminalKind::Cursor | TerminalKind::Antigravity
        )
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TerminalKind::Unknown => "unknown",
            TerminalKind::ITerm2 => "iTerm2",
            TerminalKind::AppleTerminal => "Terminal.app",
            TerminalKind::VsCode => "IDE Terminal (VSCode)",
            TerminalKind::Cursor => "IDE Terminal (Cursor)",
            TerminalKind::Antigravity => "IDE Terminal (Antigravity)",
            TerminalKind::Tmux => "tmux",
            TerminalKind::Screen => "screen",
        };
        f.write_str(label)
    }
}
