//! Claude-family adapter: `claude --output-format stream-json`.
//!
//! Grounded in the streamed `System`/`session_id` event shape used by
//! Claude Code's `stream-json` output format.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::process;
use crate::Result;

use super::{
    extract_conversation_id, extract_text_field, is_on_path, looks_like_unknown_flag_error, Chunk,
    ExecuteRequest, ExecuteResult, OnChunk, ToolAdapter,
};

const BINARY: &str = "claude";

/// Adapter for the Claude Code CLI.
pub struct ClaudeAdapter;

fn json_args(req: &ExecuteRequest) -> Vec<String> {
    let mut args = vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "-p".to_string(),
        req.prompt.clone(),
    ];
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

fn parse_stream_line(line: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return (None, None);
    };
    (extract_text_field(&value), extract_conversation_id(&value))
}

async fn run_json_mode(
    cancel: &CancellationToken,
    req: &ExecuteRequest,
    mut on_chunk: Option<&mut OnChunk<'_>>,
) -> Result<(process::RunOutput, Option<String>)> {
    let args = json_args(req);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut captured_cid: Option<String> = None;

    let output = process::run_streaming(cancel, &req.workdir, BINARY, &arg_refs, |line| {
        let (text, cid) = parse_stream_line(line);
        if let Some(cid) = cid {
            captured_cid = Some(cid);
        }
        if let (Some(text), Some(cb)) = (text, on_chunk.as_mut()) {
            cb(Chunk { text });
        }
    })
    .await?;
    Ok((output, captured_cid))
}

async fn run_plain_mode(
    cancel: &CancellationToken,
    req: &ExecuteRequest,
) -> Result<process::RunOutput> {
    let args = plain_args(req);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    process::run(cancel, &req.workdir, BINARY, &arg_refs).await
}

async fn execute_impl(
    cancel: &CancellationToken,
    req: &ExecuteRequest,
    on_chunk: Option<&mut OnChunk<'_>>,
) -> Result<ExecuteResult> {
    match run_json_mode(cancel, req, on_chunk).await {
        Ok((output, conversation_id)) => {
            let text = String::from_utf8_lossy(&output.combined).trim().to_string();
            if !output.success && looks_like_unknown_flag_error(&text) {
                let fallback = run_plain_mode(cancel, req).await?;
                let fallback_text = String::from_utf8_lossy(&fallback.combined).trim().to_string();
                return Ok(ExecuteResult {
                    success: fallback.success,
                    output: fallback_text,
                    conversation_id,
                    error: (!fallback.success).then(|| "claude exited non-zero".to_string()),
                });
            }
            Ok(ExecuteResult {
                success: output.success,
                output: text,
                conversation_id,
                error: (!output.success).then(|| "claude exited non-zero".to_string()),
            })
        }
        Err(crate::AppError::Canceled) => Err(crate::AppError::Canceled),
        Err(err) => {
            let fallback = run_plain_mode(cancel, req).await?;
            let fallback_text = String::from_utf8_lossy(&fallback.combined).trim().to_string();
            Ok(ExecuteResult {
                success: fallback.success,
                output: fallback_text,
                conversation_id: None,
                error: (!fallback.success).then(|| err.to_string()),
            })
        }
    }
}

impl ToolAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
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
