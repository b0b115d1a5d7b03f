//! The `Content-Length` framing BSP shares with LSP.
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```
//!
//! Limits are enforced before any allocation so a misbehaving peer cannot
//! make the server balloon, and JSON error strings are sanitized before
//! they leave this module: compile arguments and file paths in payloads
//! can be sensitive, and serde error messages echo scalar values.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufRead, Write};

pub const MAX_HEADER_LINE_BYTES: usize = 16 * 1024;
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

pub(crate) fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // serde wraps unknown fields/variants in backticks; redact only the
    // first segment so the "expected one of …" list stays actionable.
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

fn read_line_limited<R: BufRead>(reader: &mut R, max_len: usize) -> io::Result<Option<String>> {
    let mut buf = Vec::<u8>::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
        if buf.len() + take > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("header line exceeds maximum size ({max_len} bytes)"),
            ));
        }

        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        if newline_pos.is_some() {
            break;
        }
    }

    let line = String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "header line is not UTF-8"))?;
    Ok(Some(line))
}

/// Read one framed message body. `Ok(None)` is a clean EOF between
/// messages; EOF mid-frame is an error.
pub fn read_raw_message<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut saw_header_line = false;

    loop {
        let Some(line) = read_line_limited(reader, MAX_HEADER_LINE_BYTES)? else {
            if !saw_header_line {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF while reading message headers",
            ));
        };
        saw_header_line = true;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid Content-Length {value:?}: {err}"),
                    )
                })?);
            }
        }
    }

    let Some(content_length) = content_length else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message missing Content-Length header",
        ));
    };

    if content_length > MAX_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "message Content-Length {content_length} exceeds maximum allowed size {MAX_MESSAGE_BYTES}"
            ),
        ));
    }

    let mut buf = vec![0u8; content_length];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_raw_message<W: Write>(writer: &mut W, json_bytes: &[u8]) -> io::Result<()> {
    write!(writer, "Content-Length: {}\r\n\r\n", json_bytes.len())?;
    writer.write_all(json_bytes)?;
    writer.flush()?;
    Ok(())
}

pub fn read_json_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let Some(bytes) = read_raw_message(reader)? else {
        return Ok(None);
    };
    let parsed = serde_json::from_slice(&bytes).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            sanitize_json_error_message(&err.to_string()),
        )
    })?;
    Ok(Some(parsed))
}

pub fn write_json_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec(message).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            sanitize_json_error_message(&err.to_string()),
        )
    })?;
    write_raw_message(writer, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn round_trips_with_correct_content_length() {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "build/initialize",
            "params": {"rootUri": "file:///ws"}
        });

        let mut buf = Vec::new();
        write_json_message(&mut buf, &msg).unwrap();

        let payload = serde_json::to_vec(&msg).unwrap();
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        assert!(buf.starts_with(header.as_bytes()));

        let mut cursor = Cursor::new(buf);
        let decoded: serde_json::Value = read_json_message(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn additional_headers_are_skipped() {
        let payload = br#"{"jsonrpc":"2.0","method":"build/initialized"}"#;
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            payload.len(),
            std::str::from_utf8(payload).unwrap()
        );
        let mut cursor = Cursor::new(framed.into_bytes());
        let decoded: serde_json::Value = read_json_message(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded["method"], "build/initialized");
    }

    #[test]
    fn clean_eof_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_raw_message(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn eof_mid_headers_is_an_error() {
        let mut cursor = Cursor::new(b"Content-Length: 2\r\n".to_vec());
        let err = read_raw_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_content_length_is_rejected_before_allocation() {
        let framed = format!("Content-Length: {}\r\n\r\n", usize::MAX);
        let mut cursor = Cursor::new(framed.into_bytes());
        let err = read_raw_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Content-Length"));
    }

    #[test]
    fn overlong_header_lines_are_rejected() {
        let long = "A".repeat(MAX_HEADER_LINE_BYTES + 1);
        let framed = format!("{long}\n\n");
        let mut cursor = Cursor::new(framed.into_bytes());
        let err = read_raw_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("header line exceeds maximum size"));
    }

    #[test]
    fn json_errors_do_not_echo_payload_values() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct OnlyNumericId {
            id: i64,
        }

        let secret = "codec-super-secret-path";
        let payload = format!(r#"{{"id":"{secret}"}}"#);
        let framed = format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload);

        let mut cursor = Cursor::new(framed.into_bytes());
        let err = read_json_message::<_, OnlyNumericId>(&mut cursor).unwrap_err();
        let message = err.to_string();
        assert!(!message.contains(secret), "{message}");
        assert!(message.contains("<redacted>"), "{message}");
    }
}
