//! Parses the text of an `app_mention` into either a new-session option
//! block plus prompt, or a plain follow-up prompt.

use regex::Regex;
use std::sync::OnceLock;

use crate::{AppError, Result};

/// Options parsed from a new-session mention's `[key='value' ...]` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentionOptions {
    pub repo: String,
    pub tool: Option<String>,
    pub model: Option<String>,
    pub autopr: Option<bool>,
    pub branch_name: Option<String>,
    pub commit_msg: Option<String>,
}

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r"<@[A-Z0-9]+>") {
        Ok(re) => re,
        Err(err) => panic!("static mention regex failed to compile: {err}"),
    })
}

fn option_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r"^\[(.*?)\]\s*(.*)$") {
        Ok(re) => re,
        Err(err) => panic!("static option-block regex failed to compile: {err}"),
    })
}

fn option_pair_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r#"([a-zA-Z][a-zA-Z0-9_-]*)\s*=\s*'([^']*)'"#) {
        Ok(re) => re,
        Err(err) => panic!("static option-pair regex failed to compile: {err}"),
    })
}

/// Strip every `<@USERID>` mention token and trim surrounding whitespace.
#[must_use]
pub fn strip_mentions(text: &str) -> String {
    mention_regex().replace_all(text, "").trim().to_string()
}

/// Parse a new-session mention: a required leading `[key='value' ...]`
/// option block followed by the prompt text.
///
/// # Errors
///
/// Returns `AppError::Validation` if the text has no option block, the
/// block is malformed, an unknown key appears, `repo` is missing, `autopr`
/// is not `true`/`false`, or the remaining prompt is empty.
pub fn parse_new_session(text: &str) -> Result<(MentionOptions, String)> {
    let stripped = strip_mentions(text);
    let captures = option_block_regex()
        .captures(&stripped)
        .ok_or_else(|| AppError::Validation("expected an option block like [repo='...']".into()))?;
    let block = captures.get(1).map_or("", |m| m.as_str());
    let prompt = captures.get(2).map_or("", |m| m.as_str()).trim().to_string();

    let mut options = MentionOptions::default();
    let mut repo_seen = false;

    for pair in option_pair_regex().captures_iter(block) {
        let key = pair.get(1).map_or("", |m| m.as_str());
        let value = pair.get(2).map_or("", |m| m.as_str()).to_string();
        match key {
            "repo" => {
                options.repo = value;
                repo_seen = true;
            }
            "tool" => options.tool = Some(value),
            "model" => options.model = Some(value),
            "branch-name" => options.branch_name = Some(value),
            "commit-msg" => options.commit_msg = Some(value),
            "autopr" => {
                options.autopr = Some(match value.as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(AppError::Validation(format!(
                            "autopr must be true or false, got '{other}'"
                        )))
                    }
                });
            }
            other => return Err(AppError::Validation(format!("unknown option key '{other}'"))),
        }
    }

    if !repo_seen || options.repo.is_empty() {
        return Err(AppError::Validation("option block must set repo='...'".into()));
    }
    if prompt.is_empty() {
        return Err(AppError::Validation("prompt text is required after the option block".into()));
    }

    Ok((options, prompt))
}

/// Parse a follow-up mention: plain prompt text, no option block allowed.
///
/// # Errors
///
/// Returns `AppError::Validation` if the text starts with an option block
/// or is empty after stripping mentions.
pub fn parse_follow_up(text: &str) -> Result<String> {
    let stripped = strip_mentions(text);
    if stripped.starts_with('[') {
        return Err(AppError::Validation(
            "follow-up messages must not include an option block".into(),
        ));
    }
    if stripped.is_empty() {
        return Err(AppError::Validation("follow-up prompt must not be empty".into()));
    }
    Ok(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_new_session_mention() {
        let (opts, prompt) =
            parse_new_session("<@U123> [repo='git@example.com:org/repo.git'] fix the failing test")
                .unwrap();
        assert_eq!(opts.repo, "git@example.com:org/repo.git");
        assert_eq!(prompt, "fix the failing test");
        assert!(opts.tool.is_none());
    }

    #[test]
    fn parses_all_optional_keys() {
        let (opts, prompt) = parse_new_session(
            "[repo='r' tool='claude' model='opus' autopr='true' branch-name='fix/x' commit-msg='fix: x'] do it",
        )
        .unwrap();
        assert_eq!(opts.tool.as_deref(), Some("claude"));
        assert_eq!(opts.model.as_deref(), Some("opus"));
        assert_eq!(opts.autopr, Some(true));
        assert_eq!(opts.branch_name.as_deref(), Some("fix/x"));
        assert_eq!(opts.commit_msg.as_deref(), Some("fix: x"));
        assert_eq!(prompt, "do it");
    }

    #[test]
    fn rejects_missing_repo() {
        assert!(parse_new_session("[tool='claude'] do it").is_err());
    }

    #[test]
    fn rejects_missing_option_block() {
        assert!(parse_new_session("just do it").is_err());
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(parse_new_session("[repo='r' bogus='x'] do it").is_err());
    }

    #[test]
    fn rejects_invalid_autopr_value() {
        assert!(parse_new_session("[repo='r' autopr='yes'] do it").is_err());
    }

    #[test]
    fn follow_up_accepts_plain_text() {
        let prompt = parse_follow_up("<@U123> now also add tests").unwrap();
        assert_eq!(prompt, "now also add tests");
    }

    #[test]
    fn follow_up_rejects_option_block() {
        assert!(parse_follow_up("[repo='r'] nope").is_err());
    }
}
