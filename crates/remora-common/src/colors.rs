//! SGR escape strings for every piece of wrapper-drawn output. All
//! rendering goes through one scheme so the dark/light flag flips the
//! whole session at once.

pub const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub struct ColorScheme {
    pub prompt: &'static str,
    pub goal_prompt: &'static str,
    pub unsafe_goal_prompt: &'static str,
    pub command: &'static str,
    pub autosuggest: &'static str,
    pub answer: &'static str,
    pub answer_highlight: &'static str,
    pub goal_mode: &'static str,
    pub error: &'static str,
}

const DARK: ColorScheme = ColorScheme {
    prompt: "\x1b[38;5;154m",
    goal_prompt: "\x1b[38;5;51m",
    unsafe_goal_prompt: "\x1b[38;5;196m",
    command: "\x1b[0m",
    autosuggest: "\x1b[38;5;241m",
    answer: "\x1b[38;5;214m",
    answer_highlight: "\x1b[38;5;231m",
    goal_mode: "\x1b[38;5;51m",
    error: "\x1b[38;5;196m",
};

const LIGHT: ColorScheme = ColorScheme {
    prompt: "\x1b[38;5;28m",
    goal_prompt: "\x1b[38;5;18m",
    unsafe_goal_prompt: "\x1b[38;5;88m",
    command: "\x1b[0m",
    autosuggest: "\x1b[38;5;250m",
    answer: "\x1b[38;5;94m",
    answer_highlight: "\x1b[38;5;0m",
    goal_mode: "\x1b[38;5;18m",
    error: "\x1b[38;5;88m",
};

impl ColorScheme {
    pub fn for_dark(dark: bool) -> Self {
        if dark {
            DARK
        } else {
            LIGHT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemes_differ() {
        let d = ColorScheme::for_dark(true);
        let l = ColorScheme::for_dark(false);
        assert_ne!(d.prompt, l.prompt);
        assert_ne!(d.error, l.error);
    }

    #[test]
    fn test_all_entries_are_sgr() {
        let s = ColorScheme::for_dark(true);
        for esc in [
            s.prompt,
            s.goal_prompt,
            s.unsafe_goal_prompt,
            s.command,
            s.autosuggest,
            s.answer,
            s.answer_highlight,
            s.goal_mode,
            s.error,
        ] {
            assert!(esc.starts_with("\x1b["), "not an escape: {esc:?}");
            assert!(esc.ends_with('m'), "not SGR: {esc:?}");
        }
    }
}
