//! Aider adapter. Aider has no stable JSON-streaming output mode, so this
//! adapter always runs in plain-text mode and reports output line-by-line
//! as it is produced (no `conversationID` support — Aider tracks history
//! via its own `.aider.chat.history.md` file inside the worktree).

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::process;
use crate::Result;

use super::{is_on_path, Chunk, ExecuteRequest, ExecuteResult, OnChunk, ToolAdapter};

const BINARY: &str = "aider";

/// Adapter for the Aider CLI.
pub struct AiderAdapter;

fn args(req: &ExecuteRequest) -> Vec<String> {
    let mut args = vec!["--yes-always".to_string(), "--message".to_string(), req.prompt.clone()];
    if let Some(model) = &req.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    args
}

async fn execute_impl(
    cancel: &CancellationToken,
    req: &ExecuteRequest,
    mut on_chunk: Option<&mut OnChunk<'_>>,
) -> Result<ExecuteResult> {
    let built = args(req);
    let arg_refs: Vec<&str> = built.iter().map(String::as_str).collect();

    let output = process::run_streaming(cancel, &req.workdir, BINARY, &arg_refs, |line| {
        if let Some(cb) = on_chunk.as_mut() {
            cb(Chunk { text: line.to_string() });
        }
    })
    .await?;

    let text = String::from_utf8_lossy(&output.combined).trim().to_string();
    Ok(ExecuteResult {
        success: output.success,
        output: text,
        conversation_id: None,
        error: (!output.success).then(|| "aider exited non-zero".to_string()),
    })
}

impl ToolAdapter for AiderAdapter {
    fn name(&self) -> &'static str {
        "aider"
    }

    fn resolve_binary(&self) -> Option<&'static str> {
        is_on_path(BINARY).then_some(BINARY)
    }

    fn execute<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        req: &'a ExecuteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecuteResult>> + Send + 'a>> {
        Box::pin(async move { execute_impl(cancel, req, None).await })
    }

    fn execute_stream<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        req: &'a ExecuteRequest,
        on_chunk: &'a mut OnChunk<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecuteResult>> + Send + 'a>> {
        Box::pin(async move { execute_impl(cancel, req, Some(on_chunk)).await })
    }
}
