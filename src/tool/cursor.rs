//! Cursor-family adapter: prefers the `cursor-agent` binary, falling back to
//! the older `agent` binary name.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::process;
use crate::Result;

use super::{
    extract_conversation_id, extract_text_field, first_available, looks_like_unknown_flag_error,
    Chunk, ExecuteRequest, ExecuteResult, OnChunk, ToolAdapter,
};

const CANDIDATES: &[&str] = &["cursor-agent", "agent"];

/// Adapter for the Cursor CLI agent.
pub struct CursorAdapter;

fn json_args(binary: &str, req: &ExecuteRequest) -> Vec<String> {
    let mut args = vec!["--output-format".to_string(), "stream-json".to_string()];
    if binary == "agent" {
        // The legacy `agent` binary spells the same flag slightly differently.
        args[0] = "--output".to_string();
    }
    args.push("-p".to_string());
    args.push(req.prompt.clone());
    if let Some(model) = &req.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(cid) = &req.conversation_id {
        args.push("--resume".to_string());
        args.push(cid.clone());
    }
    args
}

fn plain_args(req: &ExecuteRequest) -> Vec<String> {
    let mut args = vec!["-p".to_string(), req.prompt.clone()];
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
    let Some(binary) = first_available(CANDIDATES) else {
        return Ok(ExecuteResult {
            success: false,
            output: String::new(),
            conversation_id: None,
            error: Some("neither cursor-agent nor agent found on PATH".to_string()),
        });
    };

    let args = json_args(binary, req);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut captured_cid: Option<String> = None;

    let output = process::run_streaming(cancel, &req.workdir, binary, &arg_refs, |line| {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            return;
        };
        if let Some(cid) = extract_conversation_id(&value) {
            captured_cid = Some(cid);
        }
        if let (Some(text), Some(cb)) = (extract_text_field(&value), on_chunk.as_mut()) {
            cb(Chunk { text });
        }
    })
    .await?;

    let text = String::from_utf8_lossy(&output.combined).trim().to_string();
    if !output.success && looks_like_unknown_flag_error(&text) {
        let plain = plain_args(req);
        let plain_refs: Vec<&str> = plain.iter().map(String::as_str).collect();
        let fallback = process::run(cancel, &req.workdir, binary, &plain_refs).await?;
        let fallback_text = String::from_utf8_lossy(&fallback.combined).trim().to_string();
        return Ok(ExecuteResult {
            success: fallback.success,
            output: fallback_text,
            conversation_id: captured_cid,
            error: (!fallback.success).then(|| format!("{binary} exited non-zero")),
        });
    }

    Ok(ExecuteResult {
        success: output.success,
        output: text,
        conversation_id: captured_cid,
        error: (!output.success).then(|| format!("{binary} exited non-zero")),
    })
}

impl ToolAdapter for CursorAdapter {
    fn name(&self) -> &'static str {
        "cursor"
    }

    fn resolve_binary(&self) -> Option<&'static str> {
        first_available(CANDIDATES)
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
