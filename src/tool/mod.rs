//! Tool adapter (C2): builds tool-specific argv, streams JSON lines or plain
//! text, extracts a conversation id, and falls back on unsupported flags.

mod aider;
mod claude;
mod cursor;
mod gemini;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Mutex, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::Result;

pub use aider::AiderAdapter;
pub use claude::ClaudeAdapter;
pub use cursor::CursorAdapter;
pub use gemini::GeminiAdapter;

/// A single chunk of incremental tool output, forwarded to the caller's
/// stream sink as it arrives.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Text extracted from a `text`/`delta`/`content` field, or a raw line
    /// in plain-text mode.
    pub text: String,
}

/// Request passed to a tool adapter for one invocation.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Working directory the tool should run in (a session's worktree, or a
    /// scratch directory for commit-message/fork-summary helper calls).
    pub workdir: std::path::PathBuf,
    /// The user's prompt.
    pub prompt: String,
    /// Optional model override.
    pub model: Option<String>,
    /// Conversation id from a prior run, threaded through for continuity.
    pub conversation_id: Option<String>,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    /// Whether the tool completed successfully.
    pub success: bool,
    /// Trimmed accumulated output text, preserved even on failure so the
    /// caller can persist it for debugging.
    pub output: String,
    /// Conversation id captured from the tool's streamed events, if any.
    pub conversation_id: Option<String>,
    /// Human-readable error, set when `success` is `false`.
    pub error: Option<String>,
}

/// A callback invoked with each incremental [`Chunk`] as it is produced.
pub type OnChunk<'a> = dyn FnMut(Chunk) + Send + 'a;

/// Capability set for an external AI coding tool. Implementations are pure
/// transports: they do not interpret the prompt or answer semantically.
pub trait ToolAdapter: Send + Sync {
    /// Stable adapter name, used as the PATH-probe cache key and as the
    /// `tool` value persisted on a session.
    fn name(&self) -> &'static str;

    /// Resolve the binary to invoke for this adapter (e.g. prefer
    /// `cursor-agent`, fall back to `agent`), probing `PATH` only once per
    /// process and caching the result.
    fn resolve_binary(&self) -> Option<&'static str>;

    /// Run the tool to completion without incremental streaming.
    fn execute<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        req: &'a ExecuteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecuteResult>> + Send + 'a>>;

    /// Run the tool, invoking `on_chunk` for each incremental piece of
    /// output as it is produced.
    fn execute_stream<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        req: &'a ExecuteRequest,
        on_chunk: &'a mut OnChunk<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecuteResult>> + Send + 'a>>;
}

/// Process-wide cache of PATH-probe results, keyed by candidate binary name.
/// Avoids re-running `which` on every invocation of a long-lived daemon.
static PATH_CACHE: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();

fn path_cache() -> &'static Mutex<HashMap<String, bool>> {
    PATH_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Probe `PATH` for `candidate`, caching the (positive or negative) result
/// for the lifetime of the process.
#[must_use]
pub fn is_on_path(candidate: &str) -> bool {
    let mut cache = path_cache().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(found) = cache.get(candidate) {
        return *found;
    }
    let found = which::which(candidate).is_ok();
    cache.insert(candidate.to_string(), found);
    found
}

/// First candidate in `candidates` found on `PATH`, in preference order.
#[must_use]
pub fn first_available(candidates: &[&'static str]) -> Option<&'static str> {
    candidates.iter().copied().find(|name| is_on_path(name))
}

/// Heuristic check for whether combined output looks like an "unsupported
/// flag" error rather than a genuine task failure, used to decide whether to
/// retry in plain-text mode with a reduced flag set.
#[must_use]
pub fn looks_like_unknown_flag_error(output: &str) -> bool {
    if output.trim().is_empty() {
        return true;
    }
    let lower = output.to_lowercase();
    [
        "unknown option",
        "unknown flag",
        "unrecognized option",
        "unrecognized arguments",
        "invalid option",
        "no such option",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Build the registry of concrete adapters, keyed by [`ToolAdapter::name`].
#[must_use]
pub fn registry() -> Vec<Box<dyn ToolAdapter>> {
    vec![
        Box::new(ClaudeAdapter),
        Box::new(CursorAdapter),
        Box::new(GeminiAdapter),
        Box::new(AiderAdapter),
    ]
}

/// Look up an adapter by name from the default registry.
#[must_use]
pub fn by_name(name: &str) -> Option<Box<dyn ToolAdapter>> {
    registry().into_iter().find(|a| a.name() == name)
}

/// Extract a `text`/`delta`/`content` string field from a streamed JSON
/// value, used by every adapter's line parser.
pub(crate) fn extract_text_field(value: &serde_json::Value) -> Option<String> {
    for key in ["text", "delta", "content"] {
        if let Some(s) = value.get(key).and_then(serde_json::Value::as_str) {
            return Some(s.to_string());
        }
    }
    None
}

/// Extract a `session_id`/`conversation_id` string field from a streamed
/// JSON value, used to capture the tool's resume token.
pub(crate) fn extract_conversation_id(value: &serde_json::Value) -> Option<String> {
    for key in ["session_id", "conversation_id", "conversationId"] {
        if let Some(s) = value.get(key).and_then(serde_json::Value::as_str) {
            return Some(s.to_string());
        }
    }
    None
}

pub(crate) fn ensure_scratch_dir(workdir: &Path) -> Result<()> {
    std::fs::create_dir_all(workdir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_text_field_prefers_text_then_delta_then_content() {
        assert_eq!(extract_text_field(&json!({"text": "a"})), Some("a".to_string()));
        assert_eq!(extract_text_field(&json!({"delta": "b"})), Some("b".to_string()));
        assert_eq!(extract_text_field(&json!({"content": "c"})), Some("c".to_string()));
        assert_eq!(extract_text_field(&json!({"text": "a", "delta": "b"})), Some("a".to_string()));
        assert_eq!(extract_text_field(&json!({"other": "x"})), None);
    }

    #[test]
    fn extract_conversation_id_checks_every_known_key() {
        assert_eq!(
            extract_conversation_id(&json!({"session_id": "s1"})),
            Some("s1".to_string())
        );
        assert_eq!(
            extract_conversation_id(&json!({"conversation_id": "c1"})),
            Some("c1".to_string())
        );
        assert_eq!(
            extract_conversation_id(&json!({"conversationId": "c2"})),
            Some("c2".to_string())
        );
        assert_eq!(extract_conversation_id(&json!({})), None);
    }

    #[test]
    fn ensure_scratch_dir_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_scratch_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
