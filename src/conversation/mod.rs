use minijinja::Environment;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Answer the user's questions clearly and concisely.";

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";

const CHAT_TEMPLATE_NAME: &str = "hf_chat_template";

/// One turn of a conversation as supplied by the caller. Roles arrive as
/// free text; anything other than `user`/`assistant` is dropped during
/// formatting (the system turn is injected here, never by callers).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Renders (prompt, history) into a single model-ready prompt string.
///
/// The model's own chat template is preferred; any compile or render failure
/// drops to the fixed ChatML markup below, so formatting itself never fails.
pub struct PromptFormatter {
    env: Option<Environment<'static>>,
}

#[derive(Serialize)]
struct TemplateContext<'a> {
    messages: &'a [ConversationTurn],
    add_generation_prompt: bool,
}

impl PromptFormatter {
    pub fn new(template: Option<String>) -> Self {
        let env = template.and_then(|raw| {
            let source: &'static str = Box::leak(raw.into_boxed_str());
            let mut env = Environment::new();
            match env.add_template(CHAT_TEMPLATE_NAME, source) {
                Ok(()) => Some(env),
                Err(err) => {
                    warn!(%err, "chat template failed to compile, using manual format");
                    None
                }
            }
        });
        Self { env }
    }

    pub fn format(&self, prompt: &str, history: &[ConversationTurn]) -> String {
        let turns = assemble_turns(prompt, history);

        if let Some(env) = &self.env {
            let ctx = TemplateContext {
                messages: &turns,
                add_generation_prompt: true,
            };
            match env
                .get_template(CHAT_TEMPLATE_NAME)
                .and_then(|tpl| tpl.render(&ctx))
            {
                Ok(rendered) => return rendered,
                Err(err) => {
                    warn!(%err, "chat template render failed, falling back to manual format");
                }
            }
        }

        manual_chatml(&turns)
    }
}

fn assemble_turns(prompt: &str, history: &[ConversationTurn]) -> Vec<ConversationTurn> {
    let mut turns = Vec::with_capacity(history.len() + 2);
    turns.push(ConversationTurn::new("system", SYSTEM_PROMPT));
    for turn in history {
        if matches!(turn.role.as_str(), "user" | "assistant") {
            turns.push(turn.clone());
        }
    }
    turns.push(ConversationTurn::new("user", prompt));
    turns
}

fn manual_chatml(turns: &[ConversationTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push_str(IM_START);
        out.push_str(&turn.role);
        out.push('\n');
        out.push_str(&turn.content);
        out.push_str(IM_END);
        out.push('\n');
    }
    out.push_str(IM_START);
    out.push_str("assistant\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keeps_only_user_and_assistant_roles() {
        let history = vec![
            ConversationTurn::new("system", "ignore me"),
            ConversationTurn::new("user", "hello"),
            ConversationTurn::new("tool", "tool output"),
            ConversationTurn::new("assistant", "hi there"),
        ];
        let turns = assemble_turns("next question", &history);

        let roles: Vec<&str> = turns.iter().map(|t| t.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(turns[1].content, "hello");
        assert_eq!(turns[2].content, "hi there");
        assert_eq!(turns[3].content, "next question");
    }

    #[test]
    fn manual_format_ends_with_open_assistant_turn() {
        let formatter = PromptFormatter::new(None);
        let out = formatter.format("Hi", &[]);

        assert!(out.starts_with(&format!("{IM_START}system\n{SYSTEM_PROMPT}{IM_END}\n")));
        assert!(out.contains(&format!("{IM_START}user\nHi{IM_END}\n")));
        assert!(out.ends_with(&format!("{IM_START}assistant\n")));
        // Exactly one unterminated turn marker at the tail.
        assert_eq!(out.matches(IM_START).count(), out.matches(IM_END).count() + 1);
    }

    #[test]
    fn template_is_used_when_it_renders() {
        let template = "{% for m in messages %}[{{ m.role }}]{{ m.content }}{% endfor %}\
                        {% if add_generation_prompt %}[assistant]{% endif %}";
        let formatter = PromptFormatter::new(Some(template.to_string()));
        let out = formatter.format("Hi", &[ConversationTurn::new("assistant", "prev")]);
        assert_eq!(
            out,
            format!("[system]{SYSTEM_PROMPT}[assistant]prev[user]Hi[assistant]")
        );
    }

    #[test]
    fn broken_template_falls_back_to_manual_format() {
        // Renders fine only until it hits the undefined function call.
        let formatter =
            PromptFormatter::new(Some("{{ raise_exception('no template') }}".to_string()));
        let out = formatter.format("Hi", &[]);
        assert!(out.ends_with(&format!("{IM_START}assistant\n")));
    }

    #[test]
    fn unparsable_template_falls_back_to_manual_format() {
        let formatter = PromptFormatter::new(Some("{% for m in %}".to_string()));
        let out = formatter.format("Hi", &[]);
        assert!(out.contains(&format!("{IM_START}user\nHi{IM_END}\n")));
    }
}
