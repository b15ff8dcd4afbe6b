//! DAP wire protocol codec
//!
//! The DAP protocol uses HTTP-style headers followed by JSON body:
//! ```text
//! Content-Length: <byte-length>\r\n
//! \r\n
//! <JSON body>
//! ```

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

/// Upper bound on a single message body
const MAX_MESSAGE: usize = 16 * 1024 * 1024;

fn read_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Disconnected
    } else {
        Error::Io(e)
    }
}

/// Read a DAP message from the stream
///
/// Parses the Content-Length header and reads the JSON body. End of stream
/// between messages is `Error::Disconnected`.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await.map_err(read_error)?;
        if bytes_read == 0 {
            return Err(Error::Disconnected);
        }

        // Empty line ends the headers
        if line == "\r\n" || line == "\n" {
            break;
        }

        let line = line.trim();
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = Some(value.trim().parse().map_err(|_| {
                Error::Protocol(format!("Invalid Content-Length: {}", value.trim()))
            })?);
        }
        // Other headers (Content-Type) are ignored
    }

    let len = content_length
        .ok_or_else(|| Error::Protocol("Missing Content-Length header".to_string()))?;
    if len > MAX_MESSAGE {
        return Err(Error::Protocol(format!(
            "Content-Length too large: {} bytes",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(read_error)?;

    String::from_utf8(body).map_err(|e| Error::Protocol(format!("Invalid UTF-8: {}", e)))
}

/// Write a DAP message to the stream
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_message() {
        let data = b"Content-Length: 13\r\n\r\n{\"test\":true}";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));

        let result = read_message(&mut reader).await.unwrap();
        assert_eq!(result, "{\"test\":true}");
    }

    #[tokio::test]
    async fn test_read_message_with_extra_headers() {
        let data =
            b"Content-Length: 13\r\nContent-Type: application/json\r\n\r\n{\"test\":true}";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));

        let result = read_message(&mut reader).await.unwrap();
        assert_eq!(result, "{\"test\":true}");
    }

    #[tokio::test]
    async fn test_read_errors() {
        let mut empty = BufReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            read_message(&mut empty).await,
            Err(Error::Disconnected)
        ));

        let mut missing = BufReader::new(Cursor::new(b"Content-Type: x\r\n\r\n{}".to_vec()));
        assert!(matches!(
            read_message(&mut missing).await,
            Err(Error::Protocol(_))
        ));

        let mut truncated = BufReader::new(Cursor::new(b"Content-Length: 40\r\n\r\n{}".to_vec()));
        assert!(matches!(
            read_message(&mut truncated).await,
            Err(Error::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_write_message() {
        let mut output = Vec::new();
        write_message(&mut output, "{\"test\":true}").await.unwrap();

        let expected = "Content-Length: 13\r\n\r\n{\"test\":true}";
        assert_eq!(String::from_utf8(output).unwrap(), expected);
    }
}
