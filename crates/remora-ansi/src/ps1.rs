//! The prompt-marker protocol. The wrapper rewrites the child shell's PS1
//! so every prompt is framed by sentinel escapes: `ESC Q` before the
//! shell's own prompt and `ESC R` after it, with a mode icon and the
//! previous command's exit code just before the suffix. Scanning child
//! output for the suffix is how the multiplexer knows a command finished
//! and what it exited with; the icon and exit code are swallowed before
//! the bytes reach the user's terminal.

use regex_lite::Regex;

pub const ICON_DEFAULT: &str = "🐠";
pub const ICON_GOAL: &str = "🟪";
pub const ICON_UNSAFE: &str = "⚡";

pub const PS1_PREFIX: &str = "\x1bQ";
pub const PS1_SUFFIX: &str = "\x1bR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Other,
}

impl ShellKind {
    pub fn from_binary(path: &str) -> Self {
        let base = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        match base {
            "bash" | "sh" => ShellKind::Bash,
            "zsh" => ShellKind::Zsh,
            _ => ShellKind::Other,
        }
    }
}

/// The icon for the current wrapper mode.
pub fn mode_icon(goal_mode: bool, unsafe_mode: bool) -> &'static str {
    if unsafe_mode {
        ICON_UNSAFE
    } else if goal_mode {
        ICON_GOAL
    } else {
        ICON_DEFAULT
    }
}

/// One line of shell input that reframes PS1 with the sentinel protocol.
/// Returns `None` for shells whose non-printing syntax we don't know;
/// those sessions run with PS1-dependent features disabled.
pub fn ps1_assignment(shell_binary: &str) -> Option<String> {
    match ShellKind::from_binary(shell_binary) {
        ShellKind::Bash => Some(format!(
            "PS1=\"\\[\\033Q\\]${{PS1}}{ICON_DEFAULT} \\$?\\[\\033R\\] \"\n"
        )),
        ShellKind::Zsh => Some(format!(
            "PS1=$'%{{\\033Q%}}'\"${{PS1}}\"$'{ICON_DEFAULT} %?%{{\\033R%}} '\n"
        )),
        ShellKind::Other => None,
    }
}

/// Regex matching the icon + exit code + suffix sentinel, capturing the
/// exit code. Compiled once per session.
pub fn ps1_suffix_regex() -> Regex {
    let pattern = format!("(?:{ICON_DEFAULT}|{ICON_GOAL}|{ICON_UNSAFE}) ([0-9]+)\u{1b}R");
    Regex::new(&pattern).expect("ps1 suffix pattern")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ps1Scan {
    /// Exit code from the most recent suffix in the scanned data.
    pub last_exit: i32,
    /// Number of prompt suffixes seen.
    pub prompt_count: usize,
    /// The data with prefixes stripped and each suffix group replaced by
    /// the current mode icon.
    pub cleaned: String,
}

/// Scan `data` for prompt markers. The prefix sentinel is removed
/// unconditionally; each `icon exit-code ESC R` group is replaced by
/// `current_icon`. Zero suffix matches leave the data otherwise unchanged.
pub fn parse_ps1(data: &str, suffix_re: &Regex, current_icon: &str) -> Ps1Scan {
    let stripped = data.replace(PS1_PREFIX, "");

    let mut last_exit = 0;
    let mut prompt_count = 0;
    for caps in suffix_re.captures_iter(&stripped) {
        prompt_count += 1;
        if let Some(code) = caps.get(1) {
            last_exit = code.as_str().parse().unwrap_or(0);
        }
    }
    if prompt_count == 0 {
        return Ps1Scan {
            last_exit: 0,
            prompt_count: 0,
            cleaned: stripped,
        };
    }

    let cleaned = suffix_re.replace_all(&stripped, current_icon).into_owned();
    Ps1Scan {
        last_exit,
        prompt_count,
        cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps1_replaces_suffix_groups() {
        let re = ps1_suffix_regex();
        let scan = parse_ps1("… 🐠 0\x1bR hello 🐠 42\x1bR", &re, "🐠");
        assert_eq!(scan.last_exit, 42);
        assert_eq!(scan.prompt_count, 2);
        assert_eq!(scan.cleaned, "… 🐠 hello 🐠");
    }

    #[test]
    fn test_parse_ps1_strips_prefix() {
        let re = ps1_suffix_regex();
        let scan = parse_ps1("\x1bQuser@host$ 🐠 0\x1bR ", &re, "🐠");
        assert_eq!(scan.prompt_count, 1);
        assert_eq!(scan.cleaned, "user@host$ 🐠 ");
    }

    #[test]
    fn test_parse_ps1_no_match_returns_data() {
        let re = ps1_suffix_regex();
        let scan = parse_ps1("just some output\n", &re, "🐠");
        assert_eq!(scan.last_exit, 0);
        assert_eq!(scan.prompt_count, 0);
        assert_eq!(scan.cleaned, "just some output\n");
    }

    #[test]
    fn test_parse_ps1_swaps_icon_for_mode() {
        let re = ps1_suffix_regex();
        // session entered goal mode; old prompts still carry the fish
        let scan = parse_ps1("$ 🐠 1\x1bR ", &re, ICON_GOAL);
        assert_eq!(scan.last_exit, 1);
        assert_eq!(scan.cleaned, "$ 🟪 ");
    }

    #[test]
    fn test_ps1_assignment_bash() {
        let line = ps1_assignment("/bin/bash").unwrap();
        assert!(line.contains("\\[\\033Q\\]"));
        assert!(line.contains("\\$?"));
        assert!(line.contains(ICON_DEFAULT));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_ps1_assignment_zsh() {
        let line = ps1_assignment("/usr/bin/zsh").unwrap();
        assert!(line.contains("%{"));
        assert!(line.contains("%?"));
    }

    #[test]
    fn test_ps1_assignment_unknown_shell() {
        assert!(ps1_assignment("/usr/bin/fish").is_none());
        assert!(ps1_assignment("/usr/local/bin/nu").is_none());
    }

    #[test]
    fn test_shell_kind() {
        assert_eq!(ShellKind::from_binary("/bin/bash"), ShellKind::Bash);
        assert_eq!(ShellKind::from_binary("/bin/sh"), ShellKind::Bash);
        assert_eq!(ShellKind::from_binary("/opt/homebrew/bin/zsh"), ShellKind::Zsh);
        assert_eq!(ShellKind::from_binary("/usr/bin/fish"), ShellKind::Other);
    }

    #[test]
    fn test_mode_icon() {
        assert_eq!(mode_icon(false, false), ICON_DEFAULT);
        assert_eq!(mode_icon(true, false), ICON_GOAL);
        assert_eq!(mode_icon(true, true), ICON_UNSAFE);
    }
}
