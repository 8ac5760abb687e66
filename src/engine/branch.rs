//! Branch name resolution, validation, and prompt-slugging for new sessions.

use chrono::Utc;

use crate::{AppError, Result};

const MAX_LEN: usize = 255;
const FORBIDDEN_CHARS: &[char] = &['~', '^', ':', '?', '*', '[', '\\'];

/// Validate a caller- or slug-derived branch name against git ref rules.
///
/// # Errors
///
/// Returns `AppError::Validation` describing the first rule violated.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AppError::Validation("branch name must not be empty".into()));
    }
    if name.len() > MAX_LEN {
        return Err(AppError::Validation(format!(
            "branch name exceeds {MAX_LEN} characters"
        )));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(AppError::Validation(
            "branch name must not start or end with '/'".into(),
        ));
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return Err(AppError::Validation(
            "branch name must not contain '..', '//', or '@{'".into(),
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(AppError::Validation(
            "branch name must not contain whitespace".into(),
        ));
    }
    if name.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return Err(AppError::Validation(format!(
            "branch name must not contain any of {FORBIDDEN_CHARS:?}"
        )));
    }
    Ok(())
}

/// Lowercase `text`, replace every run of non-`[a-z0-9]` with `-`, and trim
/// leading/trailing `-`.
#[must_use]
pub fn slug(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Resolve the final branch name for a new session: use the caller-supplied
/// name if present (validated as-is), otherwise derive
/// `<prefix>/<slug(prompt)>`, falling back to a timestamped task name if the
/// slug is empty.
///
/// # Errors
///
/// Returns `AppError::Validation` if the resolved name fails validation.
pub fn resolve(caller_branch: Option<&str>, prompt: &str, prefix: &str) -> Result<String> {
    if let Some(branch) = caller_branch {
        validate(branch)?;
        return Ok(branch.to_string());
    }

    let slugged = slug(prompt);
    let tail = if slugged.is_empty() {
        format!("task-{}", Utc::now().format("%Y%m%d%H%M%S"))
    } else {
        slugged
    };
    let name = format!("{prefix}/{tail}");
    validate(&name)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_non_alphanumeric_runs() {
        assert_eq!(slug("Fix the  login bug!!"), "fix-the-login-bug");
    }

    #[test]
    fn slug_of_only_punctuation_is_empty() {
        assert_eq!(slug("???"), "");
    }

    #[test]
    fn resolve_falls_back_to_timestamped_task_name() {
        let branch = resolve(None, "!!!", "fog").unwrap();
        assert!(branch.starts_with("fog/task-"));
    }

    #[test]
    fn validate_rejects_leading_slash() {
        assert!(validate("/fog/oops").is_err());
    }

    #[test]
    fn validate_rejects_double_dot() {
        assert!(validate("fog/weird..branch").is_err());
    }

    #[test]
    fn validate_rejects_forbidden_characters() {
        assert!(validate("fog/weird~branch").is_err());
    }

    #[test]
    fn validate_accepts_ordinary_branch() {
        assert!(validate("fog/add-login-flow").is_ok());
    }
}
