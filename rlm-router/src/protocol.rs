//! Length-prefixed JSON wire protocol between the LM Router and the
//! REPL Environments that call into it.
//!
//! Grounded on `spec.md` §6: `u32_be(length) || UTF-8 JSON payload`. A
//! `recv` that returns zero bytes before a full message is an orderly
//! close; a truncation mid-message is a framing error.

use rlm_core::{ChatCompletion, RlmError, RlmResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default per-request deadline, per `spec.md` §4.2/§5.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RouterRequest {
    pub fn single(prompt: impl Into<String>, model: Option<String>, depth: u32) -> Self {
        Self { prompt: Some(prompt.into()), prompts: None, model, depth, metadata: None }
    }

    pub fn batched(prompts: Vec<String>, model: Option<String>, depth: u32) -> Self {
        Self { prompt: None, prompts: Some(prompts), model, depth, metadata: None }
    }

    /// `true` when the request is a batched (`prompts[]`) call; the two
    /// fields are mutually exclusive (XOR) per `spec.md` §6.
    pub fn is_batched(&self) -> bool {
        self.prompts.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_completion: Option<ChatCompletion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_completions: Option<Vec<ChatCompletion>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouterResponse {
    pub fn single_ok(chat_completion: ChatCompletion) -> Self {
        Self { success: true, chat_completion: Some(chat_completion), chat_completions: None, error: None }
    }

    /// Batched success. Per `spec.md` §4.2 failure semantics, a partial
    /// failure in batched mode still produces a same-length array where
    /// each element is itself a success/error `ChatCompletion` — never a
    /// top-level `error`.
    pub fn batched_ok(chat_completions: Vec<ChatCompletion>) -> Self {
        Self { success: true, chat_completion: None, chat_completions: Some(chat_completions), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, chat_completion: None, chat_completions: None, error: Some(error.into()) }
    }
}

/// Writes `length-prefixed JSON(value)` to `writer`.
pub async fn write_framed<W, T>(writer: &mut W, value: &T) -> RlmResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .map_err(|_| RlmError::protocol("message body exceeds u32 length prefix"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON message from `reader`. Returns `Ok(None)`
/// on an orderly close (zero bytes read before any length prefix), and
/// `Err(RlmError::Protocol(_))` on a truncation mid-message.
pub async fn read_framed<R, T>(reader: &mut R) -> RlmResult<Option<T>>
where
    R: tokio::io::AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RlmError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| RlmError::protocol(format!("truncated message body: {e}")))?;
    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_request_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = RouterRequest::single("hello", Some("m1".to_string()), 2);
        write_framed(&mut a, &request).await.unwrap();
        let decoded: RouterRequest = read_framed(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded.prompt.as_deref(), Some("hello"));
        assert_eq!(decoded.depth, 2);
    }

    #[tokio::test]
    async fn orderly_close_yields_none() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let decoded: RlmResult<Option<RouterRequest>> = read_framed(&mut b).await;
        assert!(matches!(decoded, Ok(None)));
    }

    #[test]
    fn is_batched_distinguishes_shapes() {
        assert!(RouterRequest::batched(vec!["a".into()], None, 1).is_batched());
        assert!(!RouterRequest::single("a", None, 1).is_batched());
    }
}
