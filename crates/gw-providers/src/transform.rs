//! Parameter tier validation, prompt aggregation, CLA argv building, and
//! the child environment allowlist.

use gw_domain::error::Error;
use gw_domain::wire::ChatMessage;
use std::collections::HashMap;

const TIER3_KEYS: &[&str] = &[
    "tools",
    "tool_choice",
    "functions",
    "function_call",
    "response_format",
    "logprobs",
    "top_logprobs",
    "logit_bias",
];

const TIER2_KEYS: &[&str] = &[
    "temperature",
    "top_p",
    "max_tokens",
    "stop",
    "seed",
    "frequency_penalty",
    "presence_penalty",
];

/// Rejects Tier-3 parameters, and returns the Tier-2 parameter names that
/// were present (and will be silently ignored by the CLA backend).
pub fn validate_params(extra: &HashMap<String, serde_json::Value>, n: Option<u64>) -> Result<Vec<&'static str>, Error> {
    for key in TIER3_KEYS {
        if extra.contains_key(*key) {
            return Err(Error::UnsupportedParameter((*key).to_string()));
        }
    }
    if let Some(n) = n {
        if n > 1 {
            return Err(Error::UnsupportedParameter("n".to_string()));
        }
    }

    let mut ignored = Vec::new();
    for key in TIER2_KEYS {
        if extra.contains_key(*key) {
            ignored.push(*key);
        }
    }
    if extra.contains_key("n") {
        ignored.push("n");
    }
    Ok(ignored)
}

#[derive(Debug)]
pub struct BuiltPrompt {
    pub prompt: String,
    pub system_prompt: Option<String>,
}

/// Aggregates `system` messages, then collapses the remaining messages
/// into the single prompt string the CLA expects.
pub fn build_prompt(messages: &[ChatMessage], is_resume: bool) -> Result<BuiltPrompt, Error> {
    let system_parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_prompt_text())
        .collect();
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    let rest: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();

    let prompt = if is_resume {
        let last_user = rest.iter().rev().find(|m| m.role == "user");
        match last_user {
            Some(m) => m.content.as_prompt_text(),
            None => return Err(Error::InvalidRequest("no_user_messages_for_resume".into())),
        }
    } else if rest.len() == 1 {
        let content = rest[0].content.as_prompt_text();
        if content.trim().is_empty() {
            return Err(Error::InvalidRequest("empty_message_content".into()));
        }
        content
    } else {
        rest.iter()
            .map(|m| {
                let speaker = if m.role == "user" { "User" } else { "Assistant" };
                format!("{speaker}: {}", m.content.as_prompt_text())
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    Ok(BuiltPrompt { prompt, system_prompt })
}

pub struct CliArgOptions {
    pub streaming: bool,
    pub model_alias: &'static str,
    pub session_id: String,
    pub is_resume: bool,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub deliver_via_stdin: bool,
}

/// Builds the CLA's argv in the fixed order the binary expects.
pub fn build_cli_args(options: &CliArgOptions) -> Vec<String> {
    let mut args = Vec::new();

    args.push("--output-format".to_string());
    args.push(if options.streaming { "stream-json" } else { "json" }.to_string());

    args.push("--model".to_string());
    args.push(options.model_alias.to_string());

    args.push("--dangerously-skip-permissions".to_string());

    args.push("--disallowedTools".to_string());
    args.push(String::new());

    if options.is_resume {
        args.push("--resume".to_string());
    } else {
        args.push("--session-id".to_string());
    }
    args.push(options.session_id.clone());

    if let Some(system_prompt) = &options.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(system_prompt.clone());
    }

    if options.streaming {
        args.push("--verbose".to_string());
        args.push("--include-partial-messages".to_string());
    }

    if !options.deliver_via_stdin {
        args.push("-p".to_string());
        args.push(options.prompt.clone());
    }

    args
}

/// The environment allowed into the CLA child: only these names are
/// copied from the parent, with hard-coded fallbacks applied after.
pub fn build_env() -> HashMap<String, String> {
    const COPIED: [&str; 4] = ["PATH", "HOME", "LANG", "ANTHROPIC_API_KEY"];

    let mut env = HashMap::new();
    env.insert("TERM".to_string(), "dumb".to_string());

    for name in COPIED {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.to_string(), value);
        }
    }

    env.entry("HOME".to_string()).or_insert_with(|| "/tmp".to_string());
    env.entry("PATH".to_string())
        .or_insert_with(|| "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string());
    env.entry("LANG".to_string())
        .or_insert_with(|| "en_US.UTF-8".to_string());

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_domain::wire::MessageContent;

    fn msg(role: &str, text: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn tier3_param_is_rejected() {
        let mut extra = HashMap::new();
        extra.insert("tools".to_string(), serde_json::json!([]));
        let err = validate_params(&extra, None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedParameter(_)));
    }

    #[test]
    fn n_greater_than_one_is_rejected() {
        let extra = HashMap::new();
        let err = validate_params(&extra, Some(2)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedParameter(_)));
    }

    #[test]
    fn tier2_params_are_recorded_not_rejected() {
        let mut extra = HashMap::new();
        extra.insert("temperature".to_string(), serde_json::json!(0.7));
        extra.insert("n".to_string(), serde_json::json!(1));
        let ignored = validate_params(&extra, Some(1)).unwrap();
        assert!(ignored.contains(&"temperature"));
        assert!(ignored.contains(&"n"));
    }

    #[test]
    fn build_prompt_aggregates_system_messages() {
        let messages = vec![
            msg("system", "be terse"),
            msg("system", "no emoji"),
            msg("user", "hello"),
        ];
        let built = build_prompt(&messages, false).unwrap();
        assert_eq!(built.system_prompt.unwrap(), "be terse\n\nno emoji");
        assert_eq!(built.prompt, "hello");
    }

    #[test]
    fn build_prompt_multi_turn_flattens_with_speaker_prefix() {
        let messages = vec![msg("user", "hi"), msg("assistant", "hello"), msg("user", "how are you")];
        let built = build_prompt(&messages, false).unwrap();
        assert_eq!(built.prompt, "User: hi\nAssistant: hello\nUser: how are you");
    }

    #[test]
    fn build_prompt_resume_takes_last_user_message() {
        let messages = vec![msg("user", "first"), msg("assistant", "reply"), msg("user", "second")];
        let built = build_prompt(&messages, true).unwrap();
        assert_eq!(built.prompt, "second");
    }

    #[test]
    fn build_prompt_resume_without_user_message_fails() {
        let messages = vec![msg("assistant", "only assistant")];
        let err = build_prompt(&messages, true).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn build_prompt_empty_single_message_fails() {
        let messages = vec![msg("user", "   ")];
        let err = build_prompt(&messages, false).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn build_cli_args_omits_prompt_flag_for_stdin_delivery() {
        let options = CliArgOptions {
            streaming: false,
            model_alias: "sonnet",
            session_id: "11111111-1111-1111-1111-111111111111".to_string(),
            is_resume: false,
            system_prompt: None,
            prompt: "hello".to_string(),
            deliver_via_stdin: true,
        };
        let args = build_cli_args(&options);
        assert!(!args.contains(&"-p".to_string()));
    }

    #[test]
    fn build_cli_args_uses_session_id_for_new_session() {
        let options = CliArgOptions {
            streaming: false,
            model_alias: "sonnet",
            session_id: "11111111-1111-1111-1111-111111111111".to_string(),
            is_resume: false,
            system_prompt: None,
            prompt: "hello".to_string(),
            deliver_via_stdin: false,
        };
        let args = build_cli_args(&options);
        assert!(args.windows(2).any(|w| {
            w == ["--session-id".to_string(), "11111111-1111-1111-1111-111111111111".to_string()]
        }));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn build_cli_args_uses_resume_for_existing_session() {
        let options = CliArgOptions {
            streaming: true,
            model_alias: "opus",
            session_id: "abc".to_string(),
            is_resume: true,
            system_prompt: Some("be nice".to_string()),
            prompt: "hi".to_string(),
            deliver_via_stdin: false,
        };
        let args = build_cli_args(&options);
        assert!(args.windows(2).any(|w| w == ["--resume".to_string(), "abc".to_string()]));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn build_env_only_copies_allowlisted_names() {
        std::env::set_var("LD_PRELOAD", "/evil.so");
        let env = build_env();
        assert!(!env.contains_key("LD_PRELOAD"));
        assert_eq!(env.get("TERM").unwrap(), "dumb");
        std::env::remove_var("LD_PRELOAD");
    }
}
