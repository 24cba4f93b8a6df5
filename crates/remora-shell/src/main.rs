mod autosuggest;
mod goal;
mod input;
mod liveness;
mod mux;
mod state;
mod writer;

use anyhow::{Context, Result};
use autosuggest::AutosuggestScheduler;
use liveness::{LivenessCache, TuiTail, DEFAULT_TUI_TAIL_BYTES};
use mux::{Multiplexer, MuxChannels};
use remora_ansi::{parse_cursor_position, ps1_assignment, ps1_suffix_regex};
use remora_common::colors::ColorScheme;
use remora_common::config::load_config;
use remora_history::HistoryStore;
use remora_llm::factory::default_backend;
use remora_llm::openai_compat::OpenAiCompatBackend;
use remora_llm::{HeuristicTokenizer, LlmClient};
use remora_prompts::BuiltinPrompts;
use remora_pty::{enter_raw_mode, terminal_size, ShellPty};
use state::ShellState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use writer::TermWriter;

/// Resolve the shell to spawn, avoiding infinite recursion when remora
/// itself is installed as $SHELL.
fn resolve_shell(config_shell: &str) -> String {
    let candidate = std::env::var("SHELL").unwrap_or_else(|_| config_shell.to_string());
    let exe_name = std::path::Path::new(&candidate)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if exe_name.starts_with("remora") {
        if !config_shell.is_empty()
            && !std::path::Path::new(config_shell)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .starts_with("remora")
        {
            return config_shell.to_string();
        }
        for fallback in &["/bin/bash", "/bin/zsh", "/bin/sh"] {
            if std::path::Path::new(fallback).exists() {
                return fallback.to_string();
            }
        }
        "/bin/sh".to_string()
    } else {
        candidate
    }
}

fn sysinfo() -> String {
    std::process::Command::new("uname")
        .arg("-a")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

/// Read and discard the child's echo of the PS1 assignment: up to two
/// newline-terminated responses or one second, whichever first.
fn drain_ps1_echo(pty: &ShellPty) {
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut newlines = 0;
    let mut buf = [0u8; 1024];
    while newlines < 2 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let mut fds = [libc::pollfd {
            fd: pty.master_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, remaining.as_millis() as i32) };
        if ret <= 0 {
            break;
        }
        match pty.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => newlines += buf[..n].iter().filter(|&&b| b == b'\n').count(),
        }
    }
}

/// Parent terminal reader: blocks on stdin, splits cursor-position
/// reports onto their own channel so they never sit behind ordinary
/// bytes, and pushes the rest to the multiplexer.
fn spawn_parent_reader(
    tx: mpsc::Sender<Vec<u8>>,
    cursor_tx: mpsc::Sender<(u16, u16)>,
    shutdown: CancellationToken,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match nix::unistd::read(0, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut data = buf[..n].to_vec();
                    while let Some((row, col, span)) = parse_cursor_position(&data) {
                        if cursor_tx.blocking_send((row, col)).is_err() {
                            break;
                        }
                        data.drain(span);
                    }
                    if !data.is_empty() && tx.blocking_send(data).is_err() {
                        break;
                    }
                }
            }
        }
        shutdown.cancel();
    });
}

/// Child PTY reader: byte bursts from the shell, closing on EOF.
fn spawn_child_reader(
    pty: Arc<ShellPty>,
    tx: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pty.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|a| a == "--version" || a == "-V") {
        println!("remora {}", remora_common::VERSION);
        return Ok(());
    }

    let cfg = load_config().unwrap_or_default();
    let _log_guard = remora_common::logging::init(cfg.verbose).ok();

    let shell = resolve_shell(&cfg.shell.binary);
    tracing::info!(%shell, "starting session");

    // Override $SHELL in the child so programs that consult it (tmux,
    // terminal multiplexers) don't re-launch the wrapper.
    let child_env = HashMap::from([("SHELL".to_string(), shell.clone())]);
    let pty = Arc::new(ShellPty::spawn(&shell, child_env).context("failed to open PTY")?);

    // Reframe the child's PS1 with the sentinel protocol before anything
    // else is typed, and swallow the echoed assignment.
    let ps1_regex = if cfg.shell.leave_prompt_alone {
        None
    } else {
        match ps1_assignment(&shell) {
            Some(line) => {
                pty.write_all(line.as_bytes())?;
                drain_ps1_echo(&pty);
                Some(ps1_suffix_regex())
            }
            None => {
                tracing::warn!(%shell, "unknown shell syntax, PS1 features disabled");
                None
            }
        }
    };

    let raw_guard = enter_raw_mode().context("failed to set terminal raw mode")?;

    let term_size = terminal_size().unwrap_or((24, 80));
    pty.set_window_size(term_size.0, term_size.1).ok();

    let (parent_tx, parent_rx) = mpsc::channel(8);
    let (child_tx, child_rx) = mpsc::channel(8);
    let (cursor_tx, cursor_rx) = mpsc::channel(128);
    let (prompt_tx, prompt_rx) = mpsc::channel(4);
    let (error_tx, error_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    spawn_parent_reader(parent_tx, cursor_tx, shutdown.clone());
    spawn_child_reader(pty.clone(), child_tx, shutdown.clone());

    let llm: Arc<dyn LlmClient> = match default_backend(&cfg.llm) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::warn!(error = %e, "no usable LLM backend; requests will fail until configured");
            Arc::new(OpenAiCompatBackend::new(
                String::new(),
                "https://api.openai.com/v1".to_string(),
            ))
        }
    };
    let history = Arc::new(HistoryStore::new());
    let prompts = Arc::new(BuiltinPrompts);
    let tokenizer = Arc::new(HeuristicTokenizer);

    let (autosuggest, autosuggest_rx) = AutosuggestScheduler::new(
        llm.clone(),
        prompts.clone(),
        history.clone(),
        cfg.shell.autosuggest_model.clone(),
        Duration::from_secs(cfg.llm.token_timeout_secs),
        cfg.shell.autosuggest_enabled,
    );

    let winch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
        .context("failed to install SIGWINCH handler")?;

    let colors = ColorScheme::for_dark(cfg.color.dark);
    let liveness = LivenessCache::new(
        pty.child_pid(),
        Duration::from_millis(cfg.shell.liveness_cache_ms),
    );

    let mut state = ShellState::new();
    state.prompt_buf.set_term_width(term_size.1);
    state.command_buf.set_term_width(term_size.1);

    let mut mux = Multiplexer {
        cfg,
        colors,
        pty: pty.clone(),
        out: TermWriter::stdout(),
        history,
        llm,
        prompts,
        tokenizer,
        state,
        liveness,
        tui_tail: TuiTail::new(DEFAULT_TUI_TAIL_BYTES),
        autosuggest,
        prompt_tx,
        error_tx,
        term_size,
        sysinfo: sysinfo(),
        ps1_regex,
    };

    let mut channels = MuxChannels {
        parent_rx,
        child_rx,
        cursor_rx,
        prompt_rx,
        error_rx,
        autosuggest_rx,
        winch,
        shutdown: shutdown.clone(),
    };

    let result = mux.run(&mut channels).await;
    shutdown.cancel();

    // restore the terminal before exiting; process::exit skips drops
    drop(raw_guard);

    if let Err(e) = result {
        eprintln!("remora: {e}");
    }
    let exit_code = pty.wait().unwrap_or(0);
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_shell_prefers_env() {
        // SHELL is set in test environments; just assert no recursion
        let resolved = resolve_shell("/bin/bash");
        assert!(!resolved.contains("remora"));
    }

    #[test]
    fn test_sysinfo_nonempty() {
        assert!(!sysinfo().is_empty());
    }
}
