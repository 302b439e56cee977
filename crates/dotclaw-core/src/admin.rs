//! Admin command parsing.
//!
//! Recognizes `/dotclaw <subcommand> [args…]`, the `/dc` alias, and
//! mention variants (`@bot add group …`, `@bot list groups`) in raw chat
//! text. Arguments are quoted-token aware (`"…"` groups words). Unknown
//! commands parse to `None`; the message then flows to the agent like any
//! other text.

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    /// Canonical command name (e.g. `add-group`, `groups`, `set-model`).
    pub command: String,
    /// Positional arguments.
    pub args: Vec<String>,
}

/// Canonical commands accepted from the slash form.
const COMMANDS: &[&str] = &[
    "add-group",
    "remove-group",
    "groups",
    "set-model",
    "model",
    "tasks",
    "pause-task",
    "resume-task",
    "cancel-task",
    "run-task",
    "memory",
    "forget",
    "jobs",
    "status",
    "help",
];

/// Mention phrases, longest first, mapped to canonical commands.
const MENTION_PHRASES: &[(&str, &str)] = &[
    ("add group", "add-group"),
    ("remove group", "remove-group"),
    ("list groups", "groups"),
    ("groups", "groups"),
    ("set model", "set-model"),
    ("show model", "model"),
    ("model", "model"),
    ("list tasks", "tasks"),
    ("tasks", "tasks"),
    ("pause task", "pause-task"),
    ("resume task", "resume-task"),
    ("cancel task", "cancel-task"),
    ("run task", "run-task"),
    ("memory stats", "memory"),
    ("forget", "forget"),
    ("jobs", "jobs"),
    ("status", "status"),
    ("help", "help"),
];

/// Parse an admin command out of raw chat text.
///
/// `bot_name` is matched case-insensitively for the mention form, with
/// or without a leading `@`.
pub fn parse_admin_command(text: &str, bot_name: &str) -> Option<AdminCommand> {
    let trimmed = text.trim();

    for prefix in ["/dotclaw", "/dc"] {
        if let Some(rest) = strip_word_prefix(trimmed, prefix) {
            return parse_slash(rest);
        }
    }

    let bare = bot_name.trim_start_matches('@');
    for mention in [format!("@{bare}"), bare.to_string()] {
        if let Some(rest) = strip_word_prefix_ci(trimmed, &mention) {
            return parse_mention(rest);
        }
    }
    None
}

fn parse_slash(rest: &str) -> Option<AdminCommand> {
    let tokens = tokenize(rest);
    let (command, args) = tokens.split_first()?;
    let command = command.to_lowercase();
    if !COMMANDS.contains(&command.as_str()) {
        return None;
    }
    Some(AdminCommand {
        command,
        args: args.to_vec(),
    })
}

fn parse_mention(rest: &str) -> Option<AdminCommand> {
    let lower = rest.trim().to_lowercase();
    for (phrase, command) in MENTION_PHRASES {
        if lower == *phrase {
            return Some(AdminCommand {
                command: (*command).to_string(),
                args: Vec::new(),
            });
        }
        if let Some(tail) = lower.strip_prefix(phrase)
            && tail.starts_with(char::is_whitespace)
        {
            // Arguments come from the original (case-preserved) text.
            let args = tokenize(&rest.trim()[phrase.len()..]);
            return Some(AdminCommand {
                command: (*command).to_string(),
                args,
            });
        }
    }
    None
}

/// Strip `prefix` when it is the first whitespace-delimited word.
fn strip_word_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

fn strip_word_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() < prefix.len() {
        return None;
    }
    let (head, rest) = text.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

/// Whitespace tokenizer that respects double quotes.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Whether a message is an explicit cancel phrase for the active run.
pub fn is_cancel_phrase(text: &str) -> bool {
    matches!(
        text.trim().trim_end_matches(['!', '.']).to_lowercase().as_str(),
        "cancel" | "stop" | "abort"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(command: &str, args: &[&str]) -> AdminCommand {
        AdminCommand {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn slash_with_quoted_args() {
        let parsed =
            parse_admin_command("/dotclaw add-group \"-123\" \"My Group\" my-group", "bot");
        assert_eq!(
            parsed,
            Some(cmd("add-group", &["-123", "My Group", "my-group"]))
        );
    }

    #[test]
    fn dc_alias_works() {
        let parsed = parse_admin_command("/dc set-model anthropic/claude-sonnet-4.5", "bot");
        assert_eq!(
            parsed,
            Some(cmd("set-model", &["anthropic/claude-sonnet-4.5"]))
        );
    }

    #[test]
    fn mention_phrase_maps_to_canonical_command() {
        let parsed = parse_admin_command("@dotclaw_bot list groups", "dotclaw_bot");
        assert_eq!(parsed, Some(cmd("groups", &[])));
    }

    #[test]
    fn mention_with_args() {
        let parsed = parse_admin_command(
            "@dotclaw_bot add group \"-123\" \"My Group\" my-group",
            "dotclaw_bot",
        );
        assert_eq!(
            parsed,
            Some(cmd("add-group", &["-123", "My Group", "my-group"]))
        );
    }

    #[test]
    fn unknown_mention_text_is_not_a_command() {
        assert_eq!(
            parse_admin_command("@dotclaw_bot do the thing", "dotclaw_bot"),
            None
        );
    }

    #[test]
    fn unknown_slash_subcommand_is_not_a_command() {
        assert_eq!(parse_admin_command("/dotclaw frobnicate now", "bot"), None);
        assert_eq!(parse_admin_command("/dotclaw", "bot"), None);
    }

    #[test]
    fn unrelated_text_is_not_a_command() {
        assert_eq!(parse_admin_command("hello world", "bot"), None);
        assert_eq!(parse_admin_command("/dotclawx groups", "bot"), None);
    }

    #[test]
    fn mention_is_case_insensitive() {
        let parsed = parse_admin_command("@DotClaw_Bot STATUS", "dotclaw_bot");
        assert_eq!(parsed, Some(cmd("status", &[])));
    }

    #[test]
    fn tokenizer_handles_mixed_quoting() {
        assert_eq!(
            tokenize(r#"one "two three" four"#),
            vec!["one", "two three", "four"]
        );
        assert_eq!(tokenize(r#""""#), vec![""]);
        assert_eq!(tokenize("   "), Vec::<String>::new());
    }

    #[test]
    fn cancel_phrases() {
        assert!(is_cancel_phrase("cancel"));
        assert!(is_cancel_phrase("  STOP!"));
        assert!(is_cancel_phrase("abort."));
        assert!(!is_cancel_phrase("cancel the meeting tomorrow"));
    }
}
