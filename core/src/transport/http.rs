//! HTTP/1.1 fallback framing (spec.md §4.3).
//!
//! No teacher analog (`flux`'s session protocol is binary-only); newly
//! authored to satisfy spec.md's "keeps the RPC callable from trivial
//! tooling" requirement. Parses just enough of the request to find
//! `Content-Length` and the JSON body; everything else in the request is
//! ignored.

use std::io;

use crate::error::TransportError;
use crate::message::{Command, Response};

pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub content_length: usize,
    pub header_len: usize,
}

/// Parse the request line and headers from `buffer`. Returns `None` if the
/// header block (terminated by `\r\n\r\n`) is not yet fully buffered.
pub fn parse_request_head(buffer: &[u8]) -> crate::Result<Option<HttpRequest>> {
    let header_end = match find_subslice(buffer, b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None => return Ok(None),
    };

    let head = std::str::from_utf8(&buffer[..header_end])
        .map_err(|e| TransportError::MalformedHttp(e.to_string()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| TransportError::MalformedHttp("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| TransportError::MalformedHttp("missing method".into()))?.to_string();
    let path = parts.next().ok_or_else(|| TransportError::MalformedHttp("missing path".into()))?.to_string();

    let mut content_length = 0usize;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| TransportError::MalformedHttp("bad Content-Length".into()))?;
            }
        }
    }

    Ok(Some(HttpRequest { method, path, content_length, header_len: header_end }))
}

/// Decode the JSON body of an HTTP request into a `Command`.
pub fn decode_json_command(body: &[u8]) -> crate::Result<Command> {
    serde_json::from_slice(body).map_err(|e| TransportError::MalformedHttp(e.to_string()).into())
}

/// Encode a `Response` as a complete HTTP/1.1 response with a JSON body.
pub fn encode_http_response(response: &Response) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut out = Vec::new();
    out.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    out.extend_from_slice(b"Content-Type: application/json\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&body);
    Ok(out)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ResponseBody, ResponseCode};

    #[test]
    fn parses_request_line_and_content_length() {
        let raw = b"POST /rpc HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let req = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/rpc");
        assert_eq!(req.content_length, 5);
        assert_eq!(&raw[req.header_len..req.header_len + req.content_length], b"hello");
    }

    #[test]
    fn incomplete_headers_return_none() {
        let raw = b"POST /rpc HTTP/1.1\r\nContent-Length: 5\r\n";
        assert!(parse_request_head(raw).unwrap().is_none());
    }

    #[test]
    fn response_encodes_content_length_matching_body() {
        let resp = Response { code: ResponseCode::Ok, body: ResponseBody::TextResponse { message: "hi".into() } };
        let bytes = encode_http_response(&resp).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length:"));
        assert!(text.ends_with(&serde_json::to_string(&resp).unwrap()));
    }
}
