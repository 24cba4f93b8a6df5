//! Goal mode: an agent loop where the LLM drives the shell through tool
//! calls. The model gets three functions (or the provider's native shell
//! tool); the wrapper types each command into the child, watches for two
//! prompt suffixes to know it finished, feeds the output back, and asks
//! for the next step.

use crate::mux::Multiplexer;
use crate::state::{State, SUFFIX_COUNTER_DISABLED};
use regex_lite::Regex;
use remora_common::colors::RESET;
use remora_history::{assemble, BlockTag};
use remora_llm::factory::has_native_shell_tool;
use remora_llm::{CompletionRequest, CompletionResponse, FunctionCall, ToolSchema};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A goal-mode turn that produces nothing for a minute is stuck.
const GOAL_TURN_DEADLINE: Duration = Duration::from_secs(60);
const GOAL_ANSWER_TOKENS: usize = 1024;

pub(crate) fn goal_tools(native_shell: bool) -> Vec<ToolSchema> {
    let mut tools = Vec::new();
    if native_shell {
        tools.push(ToolSchema::shell());
    } else {
        tools.push(ToolSchema::function(
            "command",
            "Run a command in the user's shell and observe its output and exit code.",
            json!({
                "type": "object",
                "properties": {
                    "cmd": {"type": "string", "description": "The shell command to run."}
                },
                "required": ["cmd"],
            }),
        ));
    }
    tools.push(ToolSchema::function(
        "user_input",
        "Ask the user a question and wait for their answer.",
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"}
            },
            "required": ["question"],
        }),
    ));
    tools.push(ToolSchema::function(
        "finish",
        "Exit goal mode. Call when the goal is achieved or cannot be achieved.",
        json!({
            "type": "object",
            "properties": {
                "success": {"type": "boolean"}
            },
            "required": ["success"],
        }),
    ));
    tools
}

/// Extract `cmd` from function-call arguments. Deliberately a regex, not
/// a JSON parser: models regularly emit unescaped quotes inside the
/// command, which is invalid JSON but a perfectly recoverable call.
pub(crate) fn parse_command_args(args: &str) -> Option<String> {
    let re = Regex::new(r#"^\s*\{\s*"cmd"\s*:\s*"([\s\S]*)"\s*\}\s*$"#).ok()?;
    let caps = re.captures(args)?;
    let raw = caps.get(1)?.as_str();
    let cmd = raw.replace("\\\"", "\"").replace("\\\\", "\\").replace("\\n", "\n");
    if cmd.trim().is_empty() {
        None
    } else {
        Some(cmd)
    }
}

pub(crate) fn parse_user_input_args(args: &str) -> Option<String> {
    let value: Value = serde_json::from_str(args).ok()?;
    value["question"].as_str().map(str::to_string)
}

pub(crate) fn parse_finish_args(args: &str) -> Option<bool> {
    let value: Value = serde_json::from_str(args).ok()?;
    value["success"].as_bool()
}

impl Multiplexer {
    fn goal_banner(&self, msg: &str) {
        self.out
            .write_str(&format!("\r\n{}{msg}{RESET}\r\n", self.colors.goal_mode));
    }

    /// A prompt starting with `!` (or `!!` for unsafe auto-submit).
    pub(crate) fn start_goal_mode(&mut self, text: &str) {
        let goal_unsafe = text.starts_with("!!");
        let goal = text.trim_start_matches('!').trim().to_string();
        if goal.is_empty() {
            self.handle_error("goal mode needs a goal, e.g. `!list the largest files here`");
            return;
        }
        self.state.goal_mode = true;
        self.state.goal_unsafe = goal_unsafe;
        self.state.goal = goal;
        self.state.goal_output.clear();
        self.state.prompt_suffix_counter = 0;
        self.state.prompt_buf.reset();

        if goal_unsafe {
            self.goal_banner("goal mode (unsafe): commands will run without confirmation");
        } else {
            self.goal_banner("goal mode: press Enter to run each suggested command, Ctrl-C to exit");
        }
        self.goal_mode_prompt("");
    }

    /// A chat turn while goal mode is active: either the answer to a
    /// pending user_input call, or a course-correction from the user.
    pub(crate) fn goal_chat_turn(&mut self, text: &str) {
        self.state.prompt_buf.reset();
        if let Some((name, call_id)) = self.state.active_function.clone() {
            if name == "user_input" {
                self.history.append_function_output(&name, &call_id, text);
                self.state.active_function = None;
                self.state.prompt_suffix_counter = 0;
                self.goal_mode_prompt("");
                return;
            }
        }
        self.goal_mode_prompt(text);
    }

    /// One control cycle: build the request with the tool schema and
    /// stream the next decision from the model.
    pub(crate) fn goal_mode_prompt(&mut self, last_prompt: &str) {
        self.state.state = State::PromptResponse;
        let token = CancellationToken::new();
        self.state.prompt_response_cancel = Some(token.clone());

        // deadline: cancel the turn if the model stalls
        let deadline_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline_token.cancelled() => {}
                _ = tokio::time::sleep(GOAL_TURN_DEADLINE) => deadline_token.cancel(),
            }
        });

        let system = match self.prompts.get(
            remora_prompts::GOAL_SYSTEM,
            &[("goal", &self.state.goal), ("sysinfo", &self.sysinfo)],
        ) {
            Ok(s) => s,
            Err(e) => {
                self.handle_error(&e.to_string());
                return;
            }
        };

        let model = self.cfg.shell.prompt_model.clone();
        let tools = goal_tools(has_native_shell_tool(&model));
        let functions_json = tools_schema_json(&tools);

        let window = self.cfg.shell.max_prompt_tokens_for(&model);
        let limits = remora_history::BudgetLimits {
            max_prompt_tokens: window,
            max_history_block_tokens: self.cfg.shell.max_history_block_tokens,
            max_total_tokens: window.saturating_sub(GOAL_ANSWER_TOKENS),
        };
        let assembled = match assemble(
            last_prompt,
            &system,
            &functions_json,
            &self.history,
            &model,
            self.tokenizer.as_ref(),
            limits,
        ) {
            Ok(a) => a,
            Err(e) => {
                self.handle_error(&e.to_string());
                return;
            }
        };

        if !last_prompt.is_empty() {
            self.history.append(BlockTag::UserPrompt, last_prompt);
        }

        let mut req = CompletionRequest::new(&model, &assembled.prompt);
        req.cancel = token;
        req.system_message = system;
        req.history = assembled.history;
        req.max_tokens = GOAL_ANSWER_TOKENS;
        req.tools = tools;
        req.token_timeout = Duration::from_secs(self.cfg.llm.token_timeout_secs);
        req.verbose = self.cfg.verbose > 0;

        self.spawn_completion(req, self.colors.goal_mode);
    }

    /// Route a completed goal-mode response by its shape.
    pub(crate) fn dispatch_goal_response(&mut self, resp: CompletionResponse) {
        if !resp.shell_calls.is_empty() {
            self.dispatch_shell_calls(&resp);
            return;
        }
        let Some(mut fc) = resp.function_call.clone() else {
            self.require_function_call();
            return;
        };
        if fc.call_id.is_empty() {
            // legacy function_call payloads carry no id; mint one so the
            // call/output ledger still pairs up
            fc.call_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        }
        match fc.name.as_str() {
            "command" => match parse_command_args(&fc.arguments) {
                Some(cmd) => {
                    self.history
                        .add_function_call(&fc.name, &fc.arguments, &fc.call_id);
                    self.state.active_function = Some((fc.name.clone(), fc.call_id.clone()));
                    self.state.prompt_suffix_counter = 0;
                    self.type_command(&cmd);
                    self.state.state = State::Normal;
                }
                None => self.synthesize_function_retry(
                    &fc,
                    "arguments were not parseable; respond with JSON like {\"cmd\": \"ls -la\"}",
                ),
            },
            "user_input" => match parse_user_input_args(&fc.arguments) {
                Some(question) => {
                    self.history
                        .add_function_call(&fc.name, &fc.arguments, &fc.call_id);
                    self.state.active_function = Some((fc.name.clone(), fc.call_id.clone()));
                    self.goal_banner(&question);
                    // a prompt suffix must never auto-resume the loop
                    // while we wait on a human
                    self.state.prompt_suffix_counter = SUFFIX_COUNTER_DISABLED;
                    self.state.state = State::Normal;
                }
                None => self.synthesize_function_retry(
                    &fc,
                    "arguments were not valid JSON; respond with {\"question\": \"...\"}",
                ),
            },
            "finish" => match parse_finish_args(&fc.arguments) {
                Some(success) => {
                    if success {
                        self.goal_banner("goal achieved, exiting goal mode");
                    } else {
                        self.goal_banner("goal abandoned, exiting goal mode");
                    }
                    self.state.exit_goal_mode();
                    self.state.state = State::Normal;
                }
                None => self.synthesize_function_retry(
                    &fc,
                    "arguments were not valid JSON; respond with {\"success\": true}",
                ),
            },
            _ => self.require_function_call(),
        }
    }

    /// Native shell tool: execute the first call, acknowledge the rest
    /// as skipped so the model's tool-output ledger stays balanced.
    fn dispatch_shell_calls(&mut self, resp: &CompletionResponse) {
        let first = resp.shell_calls[0].clone();
        self.history.add_shell_call(&first);
        for extra in &resp.shell_calls[1..] {
            self.history.add_shell_call(extra);
            self.history.append_shell_call_output(
                &extra.call_id,
                "skipped: only the first shell call in a response is executed\n",
            );
        }
        self.state.prompt_suffix_counter = 0;
        self.state.active_shell_call = Some(first.clone());
        self.type_command(&first.commands.join("\n"));
        self.state.state = State::Normal;
    }

    /// Type a command into the child. Unsafe mode submits it; otherwise
    /// the user reviews and presses Enter themselves.
    fn type_command(&mut self, cmd: &str) {
        let _ = self.pty.write_all(cmd.as_bytes());
        if self.state.goal_unsafe {
            let _ = self.pty.write_all(b"\n");
        }
    }

    fn require_function_call(&mut self) {
        self.history.append(
            BlockTag::UserPrompt,
            "You must respond by calling one of the provided functions (command, user_input, finish).\n",
        );
        self.goal_mode_prompt("");
    }

    /// A malformed call still gets a balanced call/output pair so the
    /// model can see what went wrong and retry.
    fn synthesize_function_retry(&mut self, fc: &FunctionCall, msg: &str) {
        self.history
            .add_function_call(&fc.name, &fc.arguments, &fc.call_id);
        self.history
            .append_function_output(&fc.name, &fc.call_id, msg);
        self.goal_mode_prompt("");
    }

    /// Two prompt suffixes arrived after a tool command was typed: the
    /// command has finished. Record the exit code and ask for the next
    /// step.
    pub(crate) fn finish_goal_tool(&mut self) {
        self.state.goal_output.clear();
        let exit = self.state.last_exit_code;
        let trailer = format!("\nexit code: {exit}\n");
        if let Some((name, call_id)) = self.state.active_function.take() {
            self.history.append_function_output(&name, &call_id, &trailer);
        } else if let Some(call) = self.state.active_shell_call.take() {
            self.history.append_shell_call_output(&call.call_id, &trailer);
        }
        self.state.prompt_suffix_counter = 0;
        self.goal_mode_prompt("");
    }
}

fn tools_schema_json(tools: &[ToolSchema]) -> String {
    let values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}
