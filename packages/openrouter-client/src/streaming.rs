//! SSE streaming parser for chat completions.
//!
//! Converts a raw `reqwest` byte stream into `ChatCompletionChunk` values.
//! Handles `data: [DONE]`, partial lines, buffering, and tool-call deltas.

use bytes::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::OpenRouterError;

/// A single chunk from a streaming chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletionChunk {
    /// The text delta for this chunk.
    pub delta: String,
    /// Incremental tool-call fragment, when the model is emitting one.
    pub tool_call: Option<ToolCallDelta>,
    /// Finish reason, present on the final content chunk.
    pub finish_reason: Option<String>,
    /// Whether the stream is done.
    pub done: bool,
}

/// Incremental fragment of a tool call.
#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    /// Position of the tool call within the response.
    pub index: u32,
    /// Tool-call id, sent on the first fragment.
    pub id: Option<String>,
    /// Function name, sent on the first fragment.
    pub name: Option<String>,
    /// Argument JSON fragment.
    pub arguments: String,
}

// Raw wire chunk shapes

#[derive(Debug, serde::Deserialize)]
struct StreamChunkRaw {
    choices: Vec<StreamChoiceRaw>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamChoiceRaw {
    delta: DeltaRaw,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct DeltaRaw {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallRaw>,
}

#[derive(Debug, serde::Deserialize)]
struct ToolCallRaw {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ToolFunctionRaw>,
}

#[derive(Debug, serde::Deserialize)]
struct ToolFunctionRaw {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Stream adapter that converts raw SSE bytes into `ChatCompletionChunk` values.
pub struct ChatCompletionStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: String,
}

impl ChatCompletionStream {
    pub(crate) fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
        }
    }
}

impl Stream for ChatCompletionStream {
    type Item = Result<ChatCompletionChunk, OpenRouterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            // Try to parse a complete line from the buffer
            if let Some(chunk) = try_parse_line(&mut this.buffer) {
                return Poll::Ready(Some(chunk));
            }

            // Need more data from the byte stream
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => this.buffer.push_str(text),
                    Err(e) => {
                        return Poll::Ready(Some(Err(OpenRouterError::Parse(format!(
                            "Invalid UTF-8 in stream: {}",
                            e
                        )))));
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(OpenRouterError::Network(e.to_string()))));
                }
                Poll::Ready(None) => {
                    // Stream ended — check for remaining buffer content
                    if this.buffer.trim().is_empty() {
                        return Poll::Ready(None);
                    }
                    if let Some(chunk) = try_parse_line(&mut this.buffer) {
                        return Poll::Ready(Some(chunk));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Try to extract and parse a complete SSE line from the buffer.
/// Returns `None` if no complete line is available yet.
fn try_parse_line(buffer: &mut String) -> Option<Result<ChatCompletionChunk, OpenRouterError>> {
    loop {
        let newline_pos = buffer.find('\n')?;
        let line = buffer[..newline_pos].trim().to_string();
        buffer.drain(..=newline_pos);

        // Skip empty lines (SSE uses blank lines as event separators)
        if line.is_empty() {
            continue;
        }

        // OpenRouter sends ": OPENROUTER PROCESSING" keep-alive comments
        if line.starts_with(':') {
            continue;
        }

        if let Some(data) = line.strip_prefix("data: ") {
            let data = data.trim();

            if data == "[DONE]" {
                return Some(Ok(ChatCompletionChunk {
                    done: true,
                    ..Default::default()
                }));
            }

            match serde_json::from_str::<StreamChunkRaw>(data) {
                Ok(raw) => {
                    let choice = raw.choices.into_iter().next();
                    let (delta, tool_call, finish_reason) = match choice {
                        Some(c) => {
                            let tool_call = c.delta.tool_calls.into_iter().next().map(|t| {
                                let (name, arguments) = match t.function {
                                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                                    None => (None, String::new()),
                                };
                                ToolCallDelta {
                                    index: t.index,
                                    id: t.id,
                                    name,
                                    arguments,
                                }
                            });
                            (c.delta.content.unwrap_or_default(), tool_call, c.finish_reason)
                        }
                        None => (String::new(), None, None),
                    };

                    return Some(Ok(ChatCompletionChunk {
                        delta,
                        tool_call,
                        finish_reason,
                        done: false,
                    }));
                }
                Err(e) => {
                    return Some(Err(OpenRouterError::Parse(format!(
                        "Failed to parse stream chunk: {} (data: {})",
                        e,
                        &data[..data.len().min(200)]
                    ))));
                }
            }
        }

        // Skip non-data lines (e.g., "event:", "id:", "retry:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn make_sse_bytes(lines: &[&str]) -> Vec<Result<Bytes, reqwest::Error>> {
        lines
            .iter()
            .map(|line| Ok(Bytes::from(format!("{}\n", line))))
            .collect()
    }

    #[tokio::test]
    async fn parses_single_chunk() {
        let data = make_sse_bytes(&[
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
            "",
            "data: [DONE]",
        ]);

        let mut stream = ChatCompletionStream::new(futures::stream::iter(data));

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta, "Hello");
        assert!(!chunk.done);

        let done = stream.next().await.unwrap().unwrap();
        assert!(done.done);
    }

    #[tokio::test]
    async fn parses_multiple_tokens() {
        let data = make_sse_bytes(&[
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":" world"}}]}"#,
            "",
            "data: [DONE]",
        ]);

        let mut stream = ChatCompletionStream::new(futures::stream::iter(data));

        assert_eq!(stream.next().await.unwrap().unwrap().delta, "Hello");
        assert_eq!(stream.next().await.unwrap().unwrap().delta, " world");
        assert!(stream.next().await.unwrap().unwrap().done);
    }

    #[tokio::test]
    async fn skips_keepalive_comments() {
        let data = make_sse_bytes(&[
            ": OPENROUTER PROCESSING",
            r#"data: {"choices":[{"delta":{"content":"x"}}]}"#,
            "data: [DONE]",
        ]);

        let mut stream = ChatCompletionStream::new(futures::stream::iter(data));
        assert_eq!(stream.next().await.unwrap().unwrap().delta, "x");
    }

    #[tokio::test]
    async fn parses_tool_call_delta() {
        let data = make_sse_bytes(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"x\"}"}}]}}]}"#,
            "data: [DONE]",
        ]);

        let mut stream = ChatCompletionStream::new(futures::stream::iter(data));

        let first = stream.next().await.unwrap().unwrap();
        let call = first.tool_call.unwrap();
        assert_eq!(call.id.as_deref(), Some("call_1"));
        assert_eq!(call.name.as_deref(), Some("lookup"));

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.tool_call.unwrap().arguments, "\"x\"}");
    }

    #[tokio::test]
    async fn reports_finish_reason() {
        let data = make_sse_bytes(&[
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);

        let mut stream = ChatCompletionStream::new(futures::stream::iter(data));
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn handles_split_lines_across_chunks() {
        let data: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from(r#"data: {"choices":[{"delta":{"con"#)),
            Ok(Bytes::from("tent\":\"Hi\"}}]}\n")),
            Ok(Bytes::from("data: [DONE]\n")),
        ];

        let mut stream = ChatCompletionStream::new(futures::stream::iter(data));
        assert_eq!(stream.next().await.unwrap().unwrap().delta, "Hi");
    }
}
