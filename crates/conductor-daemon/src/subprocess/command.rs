//! Argument vector and environment for the agent CLI.
//!
//! Fresh run:
//! ```text
//! claude --print --output-format stream-json --verbose --session-id <id> [--agent <name>] [--model <m>] -- <prompt>
//! ```
//! Continuation:
//! ```text
//! claude --print --output-format stream-json --verbose --resume <conversation> [--model <m>] -- <prompt>
//! ```

/// Which kind of agent run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation<'a> {
    Fresh {
        session_id: &'a str,
        agent_name: &'a str,
        model: &'a str,
    },
    Resume {
        conversation_id: &'a str,
        model: &'a str,
    },
}

/// Build the discrete argument vector. The prompt is always the final,
/// single positional argument.
pub fn build_args(invocation: Invocation<'_>, prompt: &str) -> Vec<String> {
    let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

    let model = match invocation {
        Invocation::Fresh {
            session_id,
            agent_name,
            model,
        } => {
            args.push("--session-id".to_string());
            args.push(session_id.to_string());
            if !agent_name.is_empty() {
                args.push("--agent".to_string());
                args.push(agent_name.to_string());
            }
            model
        }
        Invocation::Resume {
            conversation_id,
            model,
        } => {
            args.push("--resume".to_string());
            args.push(conversation_id.to_string());
            model
        }
    };

    if !model.is_empty() {
        args.push("--model".to_string());
        args.push(model.to_string());
    }

    // End of options: a prompt starting with `-` must not parse as a flag.
    args.push("--".to_string());
    args.push(prompt.to_string());
    args
}

/// Collect `allowlist` variables that are set according to `lookup`.
pub fn filtered_env(
    allowlist: &[String],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    allowlist
        .iter()
        .filter_map(|key| lookup(key).map(|value| (key.clone(), value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_run_carries_session_id_and_prompt_last() {
        let args = build_args(
            Invocation::Fresh {
                session_id: "sess-1",
                agent_name: "reviewer",
                model: "sonnet",
            },
            "review the diff",
        );
        assert_eq!(
            args,
            vec![
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--session-id",
                "sess-1",
                "--agent",
                "reviewer",
                "--model",
                "sonnet",
                "--",
                "review the diff",
            ]
        );
    }

    #[test]
    fn resume_references_prior_conversation() {
        let args = build_args(
            Invocation::Resume {
                conversation_id: "sess-1",
                model: "",
            },
            "continue",
        );
        let pos = args.iter().position(|a| a == "--resume").unwrap_or(usize::MAX);
        assert_eq!(args.get(pos + 1).map(String::as_str), Some("sess-1"));
        assert!(!args.iter().any(|a| a == "--session-id"));
        assert!(!args.iter().any(|a| a == "--model"));
        assert_eq!(args.last().map(String::as_str), Some("continue"));
    }

    #[test]
    fn prompt_is_one_argument_even_with_shell_metacharacters() {
        let prompt = "fix it; rm -rf / && echo $HOME `id`";
        let args = build_args(
            Invocation::Fresh {
                session_id: "s",
                agent_name: "",
                model: "",
            },
            prompt,
        );
        assert_eq!(args.last().map(String::as_str), Some(prompt));
        assert!(!args.iter().any(|a| a == "--agent"));
    }

    #[test]
    fn env_keeps_only_allowlisted_and_set_keys() {
        let allow = vec!["PATH".to_string(), "ANTHROPIC_API_KEY".to_string(), "TERM".to_string()];
        let env = filtered_env(&allow, |key| match key {
            "PATH" => Some("/usr/bin".to_string()),
            "ANTHROPIC_API_KEY" => Some("k".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("nope".to_string()),
            _ => None,
        });
        assert_eq!(
            env,
            vec![
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("ANTHROPIC_API_KEY".to_string(), "k".to_string()),
            ]
        );
    }
}
