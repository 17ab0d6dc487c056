//! Wire framing for the analysis server.
//!
//! The server reads one JSON request per line on stdin and writes
//! `Content-Length: N\r\n\r\n{json}` frames on stdout. [`FrameWriter`] and
//! [`FrameReader`] handle each direction.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (32 MiB). Project-wide responses can be large, but an
/// unbounded allocation from a corrupt header is never acceptable.
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Reads header-framed JSON messages from an async reader.
///
/// Tolerates partial chunks (the underlying `BufReader` accumulates until a
/// whole header line or body is available) and blank lines between frames.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF between frames (clean shutdown).
    /// Returns `Err` on malformed headers, oversized frames or invalid JSON.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if content_length > MAX_FRAME_BYTES {
            bail!("Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        let value = serde_json::from_slice(&body).context("parsing server message")?;
        Ok(Some(value))
    }

    /// Parse headers until the empty line separator.
    ///
    /// Blank lines before the first header belong to the previous frame's
    /// trailing newline and are skipped.
    async fn read_headers(&mut self) -> Result<Option<usize>> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_header = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading header line")?;

            if bytes_read == 0 {
                if !saw_header {
                    return Ok(None);
                }
                bail!("unexpected EOF while reading headers");
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let len: usize = value
                    .trim()
                    .parse()
                    .context("invalid Content-Length value")?;
                content_length = Some(len);
            }
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => bail!("missing Content-Length header"),
        }
    }
}

/// Writes newline-delimited JSON requests to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one request followed by `\r\n`.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_string(msg).context("serializing request")?;
        line.push_str("\r\n");

        self.writer
            .write_all(line.as_bytes())
            .await
            .context("writing request")?;
        self.writer.flush().await.context("flushing request")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{body}", body.len())
    }

    #[tokio::test]
    async fn test_reads_single_frame() {
        let body = r#"{"seq":0,"type":"event","event":"typingsInstallerPid"}"#;
        let raw = frame(body);
        let mut reader = FrameReader::new(raw.as_bytes());
        let value = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(value["event"], "typingsInstallerPid");
    }

    #[tokio::test]
    async fn test_reads_frames_with_trailing_newlines() {
        // The server counts the trailing newline in Content-Length and some
        // builds emit an extra `\r\n` between frames.
        let a = "{\"request_seq\":1}\n";
        let b = "{\"request_seq\":2}\n";
        let raw = format!("{}\r\n{}", frame(a), frame(b));

        let mut reader = FrameReader::new(raw.as_bytes());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["request_seq"], 1);
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["request_seq"], 2);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_chunks_are_reassembled() {
        let body = r#"{"type":"response","request_seq":7,"success":true}"#;
        let raw = frame(body);
        let (mut tx, rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            for chunk in raw.as_bytes().chunks(5) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(rx);
        let value = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(value["request_seq"], 7);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_headers_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let mut reader = FrameReader::new(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_case_insensitive_content_length() {
        let body = r#"{"seq":1}"#;
        let raw = format!("content-length: {}\r\n\r\n{body}", body.len());
        let mut reader = FrameReader::new(raw.as_bytes());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["seq"], 1);
    }

    #[tokio::test]
    async fn test_eof_mid_body() {
        let mut reader = FrameReader::new(&b"Content-Length: 100\r\n\r\nhello"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let raw = frame("not json at all");
        let mut reader = FrameReader::new(raw.as_bytes());
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes() {
        let body = r#"{"k":"é"}"#;
        assert_eq!(body.len(), 10);
        let raw = frame(body);
        let mut reader = FrameReader::new(raw.as_bytes());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["k"], "é");
    }

    #[tokio::test]
    async fn test_writer_emits_one_line_per_request() {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer
            .write_frame(&serde_json::json!({"seq": 0, "type": "request", "command": "configure"}))
            .await
            .unwrap();
        writer
            .write_frame(&serde_json::json!({"seq": 1, "type": "request", "command": "open"}))
            .await
            .unwrap();

        let output = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = output.split("\r\n").collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "");
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["command"], "configure");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["seq"], 1);
    }
}
