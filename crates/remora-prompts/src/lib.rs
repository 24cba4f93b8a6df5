//! Named prompt templates with `{placeholder}` interpolation. The shell
//! core only depends on the narrow trait; templates live here so prompt
//! wording can evolve without touching protocol code.

use anyhow::{anyhow, Result};

pub const SHELL_SYSTEM: &str = "shell-system";
pub const GOAL_SYSTEM: &str = "goal-system";
pub const AUTOSUGGEST_NEW_COMMAND: &str = "autosuggest-new-command";
pub const AUTOSUGGEST_COMMAND: &str = "autosuggest-command";
pub const AUTOSUGGEST_PROMPT: &str = "autosuggest-prompt";

pub const TEMPLATE_NAMES: &[&str] = &[
    SHELL_SYSTEM,
    GOAL_SYSTEM,
    AUTOSUGGEST_NEW_COMMAND,
    AUTOSUGGEST_COMMAND,
    AUTOSUGGEST_PROMPT,
];

pub trait PromptLibrary: Send + Sync {
    /// Fetch `name` and substitute each `{key}` placeholder.
    fn get(&self, name: &str, args: &[(&str, &str)]) -> Result<String>;

    /// Fetch the raw template for later interpolation.
    fn get_uninterpolated(&self, name: &str) -> Result<String>;
}

pub struct BuiltinPrompts;

const SHELL_SYSTEM_TEMPLATE: &str = "\
You are an assistant that lives inside the user's terminal. You answer \
questions about shell commands, their output, and anything else a \
developer might ask at a prompt. Recent terminal history is provided as \
conversation context; use it to ground your answers. Be concise: this \
is a terminal, not a chat window.\n\
System information: {sysinfo}";

const GOAL_SYSTEM_TEMPLATE: &str = "\
You operate a unix shell to accomplish a goal for the user. Work in \
small steps: call the command function with one shell command, observe \
its output and exit code, then decide the next step. Ask the user with \
user_input when you need information only they have. Call finish with \
success true or false when the goal is done or cannot be done. Never \
explain without also calling a function.\n\
Goal: {goal}\n\
System information: {sysinfo}";

const AUTOSUGGEST_NEW_COMMAND_TEMPLATE: &str = "\
Predict the next shell command the user will type, based on their \
recent terminal history. Respond with the command only, no quoting and \
no commentary. Respond with an empty string if there is no good \
prediction.\n\
Recent history:\n{history}\n\
Next command:";

const AUTOSUGGEST_COMMAND_TEMPLATE: &str = "\
Complete the shell command the user is typing, based on their recent \
terminal history. Respond with the full completed command, including \
what the user already typed, and nothing else.\n\
Recent history:\n{history}\n\
Partial command: {command}\n\
Completed command:";

const AUTOSUGGEST_PROMPT_TEMPLATE: &str = "\
The user is typing a natural-language request in their terminal. \
Complete it plausibly, based on their recent history. Respond with the \
full completed request, including what the user already typed, and \
nothing else.\n\
Recent history:\n{history}\n\
Partial request: {command}\n\
Completed request:";

fn template_by_name(name: &str) -> Option<&'static str> {
    match name {
        SHELL_SYSTEM => Some(SHELL_SYSTEM_TEMPLATE),
        GOAL_SYSTEM => Some(GOAL_SYSTEM_TEMPLATE),
        AUTOSUGGEST_NEW_COMMAND => Some(AUTOSUGGEST_NEW_COMMAND_TEMPLATE),
        AUTOSUGGEST_COMMAND => Some(AUTOSUGGEST_COMMAND_TEMPLATE),
        AUTOSUGGEST_PROMPT => Some(AUTOSUGGEST_PROMPT_TEMPLATE),
        _ => None,
    }
}

/// Replace each `{key}` with its value. Unknown placeholders are left
/// in place so a malformed call is visible rather than silent.
pub fn interpolate(template: &str, args: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in args {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

impl PromptLibrary for BuiltinPrompts {
    fn get(&self, name: &str, args: &[(&str, &str)]) -> Result<String> {
        let template =
            template_by_name(name).ok_or_else(|| anyhow!("unknown prompt template: {name}"))?;
        Ok(interpolate(template, args))
    }

    fn get_uninterpolated(&self, name: &str) -> Result<String> {
        template_by_name(name)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("unknown prompt template: {name}"))
    }
}
