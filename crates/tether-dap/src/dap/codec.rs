use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{DapError, Result, MAX_DAP_HEADER_LINE_BYTES, MAX_DAP_MESSAGE_BYTES};

/// Reads DAP-framed JSON messages from a byte stream.
///
/// DAP messages are framed using an HTTP-like header section:
///
/// ```text
/// Content-Length: 123\r\n
/// \r\n
/// { ...json... }
/// ```
pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read one framed message. Returns `Ok(None)` on a clean EOF between
    /// messages; EOF in the middle of a frame is an error.
    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header_line = false;
        let mut line = String::new();

        loop {
            line.clear();
            let n = (&mut self.reader)
                .take(MAX_DAP_HEADER_LINE_BYTES as u64 + 1)
                .read_line(&mut line)
                .await?;
            if n == 0 {
                if !saw_header_line {
                    return Ok(None);
                }
                return Err(DapError::Protocol(
                    "EOF while reading DAP headers".to_string(),
                ));
            }
            if n > MAX_DAP_HEADER_LINE_BYTES {
                return Err(DapError::Protocol(format!(
                    "DAP header line exceeds maximum size ({MAX_DAP_HEADER_LINE_BYTES} bytes)"
                )));
            }
            saw_header_line = true;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }

            let Some((name, value)) = trimmed.split_once(':') else {
                continue;
            };

            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|e| {
                    DapError::Protocol(format!("invalid Content-Length {value:?}: {e}"))
                })?);
            }
        }

        let Some(len) = content_length else {
            return Err(DapError::Protocol(
                "DAP message missing Content-Length header".to_string(),
            ));
        };

        // Check the limit before allocating the body buffer.
        if len > MAX_DAP_MESSAGE_BYTES {
            return Err(DapError::Protocol(format!(
                "DAP message Content-Length {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            )));
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(serde_json::from_slice::<Value>(&buf)?))
    }
}

/// Writes DAP-framed JSON messages to a byte stream.
pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n", bytes.len()).as_bytes())
            .await?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the underlying stream. Errors are reported but the writer
    /// is unusable afterwards either way.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    async fn read_one(bytes: Vec<u8>) -> Result<Option<Value>> {
        DapReader::new(Cursor::new(bytes)).read_value().await
    }

    #[tokio::test]
    async fn roundtrips_json_message_with_correct_content_length() {
        let msg = json!({
            "seq": 1,
            "type": "request",
            "command": "initialize",
            "arguments": {"adapterID": "tether"}
        });

        let mut buf = Vec::new();
        DapWriter::new(&mut buf).write_value(&msg).await.unwrap();

        let payload = serde_json::to_vec(&msg).unwrap();
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        assert!(buf.starts_with(header.as_bytes()));

        let decoded = read_one(buf).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn accepts_additional_headers() {
        let payload = br#"{"seq":1,"type":"request","command":"threads"}"#;
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            payload.len(),
            std::str::from_utf8(payload).unwrap()
        );
        let decoded = read_one(framed.into_bytes()).await.unwrap().unwrap();
        assert_eq!(decoded["command"], "threads");
    }

    #[tokio::test]
    async fn clean_eof_between_messages_returns_none() {
        assert!(read_one(Vec::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_headers_is_an_error() {
        let err = read_one(b"Content-Length: 2\r\n".to_vec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("EOF while reading DAP headers"));
    }

    #[tokio::test]
    async fn rejects_oversized_content_length_without_allocating_message_body() {
        // `usize::MAX` is intentionally far beyond the maximum. This guards
        // against regressions where the body buffer is allocated before the
        // limit check (which would likely panic or OOM).
        let framed = format!("Content-Length: {}\r\n\r\n", usize::MAX);
        let err = read_one(framed.into_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("Content-Length"));
    }

    #[tokio::test]
    async fn rejects_overlong_header_lines() {
        let long = "A".repeat(MAX_DAP_HEADER_LINE_BYTES + 1);
        let framed = format!("{long}\r\n\r\n");
        let err = read_one(framed.into_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("header line exceeds maximum size"));
    }

    #[tokio::test]
    async fn missing_content_length_is_an_error() {
        let framed = "Content-Type: application/json\r\n\r\n{}";
        let err = read_one(framed.as_bytes().to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("missing Content-Length"));
    }
}
