//! Scrollback capture for the supported terminal programs.
//!
//! Native terminals are read through their automation interface, multiplexers
//! through their history dump commands. IDE-embedded terminals can only be
//! captured when nested in tmux; when that (or a multiplexer binary) is missing
//! the newest session transcript from the global home is copied instead.

use crate::context::{EnvSnapshot, TERM_PROGRAM_ENV, TMUX_ENV};
use crate::error::{GodoError, Result};
use crate::fsutil::{copy_contents, ensure_parent};
use crate::process::{args, BinaryLocator, CommandRunner};
use crate::terminal::{TerminalKind, SUPPORTED_TERMINALS};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const TRANSCRIPT_PATTERN: &str = "claude-session-*.log";

const ITERM2_SCRIPT: &str = r#"tell application "iTerm2"
    tell current session of current window
        set sessionContents to contents
        return sessionContents
    end tell
end tell"#;

const APPLE_TERMINAL_SCRIPT: &str = r#"tell application "Terminal"
    set sessionContents to contents of selected tab of front window
    return sessionContents
end tell"#;

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub output: PathBuf,
    /// Keep only the final N lines, applied after the full buffer is read.
    pub tail_lines: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Live(TerminalKind),
    TranscriptFallback { transcript: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub output: PathBuf,
    pub line_count: usize,
    pub source: CaptureSource,
}

#[derive(Debug)]
pub struct CaptureFailure {
    pub error: GodoError,
    pub multiplexer_missing: bool,
}

impl CaptureFailure {
    fn failed(error: GodoError) -> Self {
        Self {
            error,
            multiplexer_missing: false,
        }
    }

    fn multiplexer_missing(error: GodoError) -> Self {
        Self {
            error,
            multiplexer_missing: true,
        }
    }
}

pub struct ScrollbackCapturer<'a, R: CommandRunner, L: BinaryLocator> {
    runner: &'a R,
    locator: &'a L,
    env: &'a EnvSnapshot,
    scratch_dir: PathBuf,
}

impl<'a, R: CommandRunner, L: BinaryLocator> ScrollbackCapturer<'a, R, L> {
    pub fn new(runner: &'a R, locator: &'a L, env: &'a EnvSnapshot, scratch_dir: PathBuf) -> Self {
        Self {
            runner,
            locator,
            env,
            scratch_dir,
        }
    }

    /// Reads the whole session buffer for `kind`.
    pub fn capture_live(&self, kind: TerminalKind) -> std::result::Result<Vec<u8>, CaptureFailure> {
        match kind {
            TerminalKind::ITerm2 => self.osascript("iTerm2", ITERM2_SCRIPT),
            TerminalKind::AppleTerminal => self.osascript("Terminal.app", APPLE_TERMINAL_SCRIPT),
            TerminalKind::Tmux => self.tmux_history(),
            TerminalKind::Screen => self.screen_history(),
            TerminalKind::VsCode | TerminalKind::Cursor | TerminalKind::Antigravity => {
                self.nested_tmux()
            }
            TerminalKind::Unknown => Err(CaptureFailure::failed(self.unknown_terminal())),
        }
    }

    fn unknown_terminal(&self) -> GodoError {
        GodoError::UnknownTerminal {
            observed: self.env.get(TERM_PROGRAM_ENV).unwrap_or("").to_string(),
            supported: SUPPORTED_TERMINALS.to_string(),
        }
    }

    fn osascript(&self, app: &str, script: &str) -> std::result::Result<Vec<u8>, CaptureFailure> {
        let output = self
            .runner
            .run("osascript", &args(["-e", script]), true)
            .map_err(|err| {
                CaptureFailure::failed(GodoError::Process(format!(
                    "{app} capture failed: unable to run osascript: {err}"
                )))
            })?;
        if !output.success() {
            return Err(CaptureFailure::failed(GodoError::Process(format!(
                "{app} capture failed (exit {}): {}",
                output.status_code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(output.stdout)
    }

    fn tmux_history(&self) -> std::result::Result<Vec<u8>, CaptureFailure> {
        // -S - / -E -: from the first line of history to the last line of the pane.
        let output = self
            .runner
            .run("tmux", &args(["capture-pane", "-p", "-S", "-", "-E", "-"]), true)
            .map_err(|err| spawn_failure("tmux", err))?;
        if !output.success() {
            return Err(CaptureFailure::failed(GodoError::Process(format!(
                "tmux capture failed (exit {}): {}",
                output.status_code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(output.stdout)
    }

    fn screen_history(&self) -> std::result::Result<Vec<u8>, CaptureFailure> {
        let dump = self
            .scratch_dir
            .join(format!("screen-capture-{}.txt", std::process::id()));
        let dump_arg = dump.to_string_lossy().to_string();
        let result = self
            .runner
            .run(
                "screen",
                &args(["-X", "hardcopy", "-h", dump_arg.as_str()]),
                true,
            )
            .map_err(|err| spawn_failure("screen", err))
            .and_then(|output| {
                if !output.success() {
                    return Err(CaptureFailure::failed(GodoError::Process(format!(
                        "screen capture failed (exit {})",
                        output.status_code
                    ))));
                }
                fs::read(&dump).map_err(|err| {
                    CaptureFailure::failed(GodoError::Process(format!(
                        "failed to read screen capture {}: {err}",
                        dump.display()
                    )))
                })
            });
        let _ = fs::remove_file(&dump);
        result
    }

    fn nested_tmux(&self) -> std::result::Result<Vec<u8>, CaptureFailure> {
        if self.locator.locate("tmux").is_none() {
            return Err(CaptureFailure::multiplexer_missing(GodoError::precondition(
                "IDE terminals can only be captured through tmux, which is not installed",
                "Install it with: brew install tmux (or your package manager), then run the IDE terminal inside tmux",
            )));
        }
        if !self.env.is_set(TMUX_ENV) {
            return Err(CaptureFailure::multiplexer_missing(GodoError::precondition(
                "IDE terminals can only be captured from inside a tmux session",
                "Start one with: tmux new -s work, then run the capture again from that session",
            )));
        }
        self.tmux_history()
    }
}

fn spawn_failure(program: &str, err: io::Error) -> CaptureFailure {
    let error = GodoError::Process(format!("{program} capture failed: {err}"));
    if err.kind() == io::ErrorKind::NotFound {
        CaptureFailure::multiplexer_missing(error)
    } else {
        CaptureFailure::failed(error)
    }
}

/// Captures the hosting terminal into `request.output`, falling back to the
/// newest transcript in `transcript_dir` when live capture is impossible.
pub fn capture<R: CommandRunner, L: BinaryLocator>(
    capturer: &ScrollbackCapturer<'_, R, L>,
    kind: TerminalKind,
    request: &CaptureRequest,
    transcript_dir: &Path,
) -> Result<CaptureReport> {
    if kind == TerminalKind::Unknown {
        return Err(capturer.unknown_terminal());
    }
    match capturer.capture_live(kind) {
        Ok(content) => {
            let content = match request.tail_lines {
                Some(n) => keep_last_lines(&content, n),
                None => content,
            };
            ensure_parent(&request.output)?;
            fs::write(&request.output, &content)?;
            info!(terminal = %kind, output = %request.output.display(), "captured scrollback");
            Ok(CaptureReport {
                output: request.output.clone(),
                line_count: count_lines(&content),
                source: CaptureSource::Live(kind),
            })
        }
        Err(failure) if kind.is_ide() || failure.multiplexer_missing => {
            warn!(terminal = %kind, error = %failure.error, "live capture failed, using transcript fallback");
            let transcript = copy_latest_transcript(transcript_dir, &request.output)?;
            let written = fs::read(&request.output)?;
            Ok(CaptureReport {
                output: request.output.clone(),
                line_count: count_lines(&written),
                source: CaptureSource::TranscriptFallback {
                    transcript,
                    reason: failure.error.to_string(),
                },
            })
        }
        Err(failure) => Err(failure.error),
    }
}

/// Counts on a lossy view; the captured bytes themselves are never re-encoded.
pub fn count_lines(content: &[u8]) -> usize {
    let text = String::from_utf8_lossy(content);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        0
    } else {
        trimmed.split('\n').count()
    }
}

pub fn keep_last_lines(content: &[u8], lines: usize) -> Vec<u8> {
    let all: Vec<&[u8]> = content.split(|byte| *byte == b'\n').collect();
    if all.len() <= lines {
        return content.to_vec();
    }
    all[all.len() - lines..].join(&b'\n')
}

/// Newest `claude-session-*.log` in `dir` by modification time.
///
/// On equal timestamps the lexicographically last path wins.
pub fn latest_transcript(dir: &Path) -> Result<PathBuf> {
    let escaped_dir = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = Path::new(&escaped_dir)
        .join(TRANSCRIPT_PATTERN)
        .to_string_lossy()
        .to_string();
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in glob::glob(&pattern)? {
        let Ok(path) = entry else { continue };
        let Ok(modified) = fs::metadata(&path).and_then(|meta| meta.modified()) else {
            continue;
        };
        debug!(path = %path.display(), "transcript candidate");
        match &newest {
            Some((best, _)) if modified < *best => {}
            _ => newest = Some((modified, path)),
        }
    }
    newest.map(|(_, path)| path).ok_or_else(|| {
        GodoError::Process(format!(
            "no session transcripts found (looked for {})",
            dir.join(TRANSCRIPT_PATTERN).display()
        ))
    })
}

pub fn copy_latest_transcript(dir: &Path, output: &Path) -> Result<PathBuf> {
    let latest = latest_transcript(dir)?;
    copy_contents(&latest, output)?;
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SCREEN_ENV;
    use crate::process::testing::{MockLocator, MockRunner};
    use std::fs::File;
    use std::time::Duration;
    use tempfile::tempdir;

    fn set_mtime(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs_ago);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[test]
    fn native_capture_writes_full_buffer_verbatim() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let buffer = "$ make test\nrunning 3 tests\nok\n\n$ \n";
        runner.push_output("osascript", 0, buffer);
        let env = EnvSnapshot::from_pairs([(TERM_PROGRAM_ENV, "iTerm.app")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());
        let request = CaptureRequest {
            output: dir.path().join("out").join("terminal.txt"),
            tail_lines: None,
        };

        let report = capture(
            &capturer,
            TerminalKind::detect(&env),
            &request,
            &dir.path().join("home"),
        )
        .unwrap();

        assert_eq!(fs::read_to_string(&request.output).unwrap(), buffer);
        assert_eq!(report.line_count, 5);
        assert_eq!(report.source, CaptureSource::Live(TerminalKind::ITerm2));
        let calls = runner.calls_to("osascript");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args[1].contains("contents"));
    }

    #[test]
    fn tmux_capture_requests_entire_history() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        runner.push_output("tmux", 0, "history line 1\nhistory line 2\nvisible prompt\n");
        let env = EnvSnapshot::from_pairs([(TMUX_ENV, "/tmp/tmux-1000/default,99,0")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());

        let text = capturer.capture_live(TerminalKind::Tmux).unwrap();

        assert!(String::from_utf8_lossy(&text).contains("history line 1"));
        let call = &runner.calls_to("tmux")[0];
        assert_eq!(
            call.args,
            vec!["capture-pane", "-p", "-S", "-", "-E", "-"]
        );
    }

    #[test]
    fn screen_capture_uses_hardcopy_with_history() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let env = EnvSnapshot::from_pairs([(SCREEN_ENV, "77.pts-2.box")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());

        // The mock never writes the dump file, so reading it fails.
        let failure = capturer.capture_live(TerminalKind::Screen).unwrap_err();
        assert!(!failure.multiplexer_missing);
        let call = &runner.calls_to("screen")[0];
        assert_eq!(&call.args[..3], &["-X", "hardcopy", "-h"]);
    }

    #[test]
    fn ide_without_tmux_binary_is_remediable() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let env = EnvSnapshot::from_pairs([(TERM_PROGRAM_ENV, "vscode")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());

        let failure = capturer.capture_live(TerminalKind::VsCode).unwrap_err();
        assert!(failure.multiplexer_missing);
        assert!(failure.error.to_string().contains("brew install tmux"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn ide_outside_tmux_session_is_remediable() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let env = EnvSnapshot::from_pairs([(TERM_PROGRAM_ENV, "cursor")]);
        let locator = MockLocator::with("tmux", "/opt/homebrew/bin/tmux");
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());

        let failure = capturer.capture_live(TerminalKind::Cursor).unwrap_err();
        assert!(failure.error.to_string().contains("tmux session"));
    }

    #[test]
    fn ide_failure_falls_back_to_newest_transcript() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let old = home.join("claude-session-20240101.log");
        let newest = home.join("claude-session-20240102.log");
        let middle = home.join("claude-session-20240103.log");
        fs::write(&old, "old\n").unwrap();
        fs::write(&newest, "newest line\nsecond\x00bytes\n").unwrap();
        fs::write(&middle, "middle\n").unwrap();
        fs::write(home.join("unrelated.log"), "nope\n").unwrap();
        set_mtime(&old, 300);
        set_mtime(&middle, 200);
        set_mtime(&newest, 10);

        let runner = MockRunner::default();
        let env = EnvSnapshot::from_pairs([(TERM_PROGRAM_ENV, "antigravity")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());
        let request = CaptureRequest {
            output: dir.path().join("deep").join("dir").join("capture.txt"),
            tail_lines: None,
        };

        let report = capture(&capturer, TerminalKind::Antigravity, &request, &home).unwrap();

        assert_eq!(
            fs::read(&request.output).unwrap(),
            fs::read(&newest).unwrap()
        );
        assert_eq!(report.line_count, 2);
        match report.source {
            CaptureSource::TranscriptFallback { transcript, .. } => assert_eq!(transcript, newest),
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[test]
    fn fallback_without_transcripts_fails() {
        let dir = tempdir().unwrap();
        let err = copy_latest_transcript(dir.path(), &dir.path().join("out.txt")).unwrap_err();
        assert!(err.to_string().contains("no session transcripts"));
        assert!(!dir.path().join("out.txt").exists());
    }

    #[test]
    fn missing_multiplexer_binary_is_fallback_eligible() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("claude-session-1.log"), "from log\n").unwrap();
        let runner = MockRunner::default();
        runner.push_spawn_error("tmux");
        let env = EnvSnapshot::from_pairs([(TMUX_ENV, "/tmp/tmux/default,1,0")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());
        let request = CaptureRequest {
            output: dir.path().join("out.txt"),
            tail_lines: None,
        };

        let report = capture(&capturer, TerminalKind::Tmux, &request, dir.path()).unwrap();
        assert!(matches!(
            report.source,
            CaptureSource::TranscriptFallback { .. }
        ));
    }

    #[test]
    fn native_failure_is_not_masked_by_fallback() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("claude-session-1.log"), "from log\n").unwrap();
        let runner = MockRunner::default();
        runner.push_output("osascript", 1, "");
        let env = EnvSnapshot::from_pairs([(TERM_PROGRAM_ENV, "Apple_Terminal")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());
        let request = CaptureRequest {
            output: dir.path().join("out.txt"),
            tail_lines: None,
        };

        let err = capture(&capturer, TerminalKind::AppleTerminal, &request, dir.path()).unwrap_err();
        assert!(err.to_string().contains("Terminal.app capture failed"));
        assert!(!request.output.exists());
    }

    #[test]
    fn unknown_terminal_reports_observed_signal() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let env = EnvSnapshot::from_pairs([(TERM_PROGRAM_ENV, "WarpTerminal")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());
        let request = CaptureRequest {
            output: dir.path().join("out.txt"),
            tail_lines: None,
        };

        let err = capture(&capturer, TerminalKind::Unknown, &request, dir.path()).unwrap_err();
        assert!(err.to_string().contains("WarpTerminal"));
    }

    #[test]
    fn tail_limit_runs_after_full_capture() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        runner.push_output("tmux", 0, "one\ntwo\nthree\nfour");
        let env = EnvSnapshot::from_pairs([(TMUX_ENV, "/tmp/tmux/default,1,0")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());
        let request = CaptureRequest {
            output: dir.path().join("out.txt"),
            tail_lines: Some(2),
        };

        let report = capture(&capturer, TerminalKind::Tmux, &request, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&request.output).unwrap(), "three\nfour");
        assert_eq!(report.line_count, 2);
        assert_eq!(runner.calls_to("tmux")[0].args[3], "-");
    }

    #[test]
    fn tmux_capture_keeps_non_utf8_bytes() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let buffer: &[u8] = b"caf\xe9 latin1\n\xff\n";
        runner.push_raw_output("tmux", 0, buffer);
        let env = EnvSnapshot::from_pairs([(TMUX_ENV, "/tmp/tmux/default,1,0")]);
        let locator = MockLocator::default();
        let capturer = ScrollbackCapturer::new(&runner, &locator, &env, dir.path().to_path_buf());
        let request = CaptureRequest {
            output: dir.path().join("out.bin"),
            tail_lines: None,
        };

        let report = capture(&capturer, TerminalKind::Tmux, &request, dir.path()).unwrap();

        assert_eq!(fs::read(&request.output).unwrap(), buffer);
        assert_eq!(report.line_count, 2);
    }

    #[test]
    fn line_helpers() {
        assert_eq!(count_lines(b""), 0);
        assert_eq!(count_lines(b"a\nb\n\n"), 2);
        assert_eq!(keep_last_lines(b"a\nb\nc", 5), b"a\nb\nc".to_vec());
        assert_eq!(keep_last_lines(b"a\nb\nc", 1), b"c".to_vec());
        assert_eq!(keep_last_lines(b"\xffx\n\xfe", 1), b"\xfe".to_vec());
    }
}
