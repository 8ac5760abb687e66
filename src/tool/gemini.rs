//! Gemini-family adapter.
//!
//! The upstream flag matrix for this tool is speculative (per the source
//! material's own admission) — `--yolo` in particular may or may not exist
//! on a given Gemini CLI version. Kept as a single provider-specific table
//! here rather than scattered across call sites, so a future flag rename is
//! a one-line change.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::process;
use crate::Result;

use super::{
    extract_conversation_id, extract_text_field, is_on_path, looks_like_unknown_flag_error, Chunk,
    ExecuteRequest, ExecuteResult, OnChunk, ToolAdapter,
};

const BINARY: &str = "gemini";

/// Provider-specific flags, tried in order for the JSON-streaming mode.
const JSON_FLAG_VARIANTS: &[&[&str]] = &[&["--output-format", "stream-json"], &["--yolo", "--json"]];

/// Adapter for the Gemini CLI.
pub struct GeminiAdapter;

fn base_args(req: &ExecuteRequest) -> Vec<String> {
    let mut args = vec!["-p".to_string(), req.prompt.clone()];
    if let Some(model) = &req.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    args
}

async fn try_json_variant(
    cancel: &CancellationToken,
    req: &ExecuteRequest,
    flags: &[&str],
    mut on_chunk: Option<&mut OnChunk<'_>>,
) -> Result<(process::RunOutput, Option<String>)> {
    let mut args: Vec<String> = flags.iter().map(|s| (*s).to_string()).collect();
    args.extend(base_args(req));
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut captured_cid = None;

    let output = process::run_streaming(cancel, &req.workdir, BINARY, &arg_refs, |line| {
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
    Ok((output, captured_cid))
}

async fn execute_impl(
    cancel: &CancellationToken,
    req: &ExecuteRequest,
    mut on_chunk: Option<&mut OnChunk<'_>>,
) -> Result<ExecuteResult> {
    for flags in JSON_FLAG_VARIANTS {
        let result = try_json_variant(cancel, req, flags, on_chunk.as_deref_mut()).await;
        match result {
            Ok((output, conversation_id)) => {
                let text = String::from_utf8_lossy(&output.combined).trim().to_string();
                if !output.success && looks_like_unknown_flag_error(&text) {
                    continue;
                }
                return Ok(ExecuteResult {
                    success: output.success,
                    output: text,
                    conversation_id,
                    error: (!output.success).then(|| "gemini exited non-zero".to_string()),
                });
            }
            Err(crate::AppError::Canceled) => return Err(crate::AppError::Canceled),
            Err(_) => continue,
        }
    }

    let args = base_args(req);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let fallback = process::run(cancel, &req.workdir, BINARY, &arg_refs).await?;
    let text = String::from_utf8_lossy(&fallback.combined).trim().to_string();
    Ok(ExecuteResult {
        success: fallback.success,
        output: text,
        conversation_id: None,
        error: (!fallback.success).then(|| "gemini exited non-zero".to_string()),
    })
}

impl ToolAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
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
