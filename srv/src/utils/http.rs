//! Minimal HTTP/1.1 reader and writer, one request per connection.

use std::io::{self, BufRead, Read, Write};

use thiserror::Error;

/// Largest request body accepted, enough for the biggest value plus JSON.
pub const MAX_BODY_SIZE: u64 = 65 * 1024 * 1024;

const MAX_LINE_SIZE: u64 = 8 * 1024;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("connection closed before the request was complete")]
    UnexpectedEof,

    #[error("malformed request line: {0:?}")]
    RequestLine(String),

    #[error("malformed header: {0:?}")]
    Header(String),

    #[error("too many headers")]
    TooManyHeaders,

    #[error("invalid content length: {0:?}")]
    ContentLength(String),

    #[error("request body of {0} bytes is too large")]
    BodyTooLarge(u64),
}

pub type Result<T> = std::result::Result<T, HttpError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Read one request: request line, headers, then a body of
    /// `Content-Length` bytes (none if the header is missing).
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let line = read_line(reader)?.ok_or(HttpError::UnexpectedEof)?;

        let mut parts = line.split_whitespace();
        let (method, path) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(version), None)
                if version.starts_with("HTTP/") && path.starts_with('/') =>
            {
                (method.to_string(), path.to_string())
            }
            _ => return Err(HttpError::RequestLine(line)),
        };

        let mut headers = Vec::new();
        loop {
            let line = read_line(reader)?.ok_or(HttpError::UnexpectedEof)?;
            if line.is_empty() {
                break;
            }
            if headers.len() == MAX_HEADERS {
                return Err(HttpError::TooManyHeaders);
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Header(line.clone()))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut req = Request {
            method,
            path,
            headers,
            body: Vec::new(),
        };

        if let Some(len) = req.header("content-length") {
            let len: u64 = len
                .parse()
                .map_err(|_| HttpError::ContentLength(len.to_string()))?;
            if len > MAX_BODY_SIZE {
                return Err(HttpError::BodyTooLarge(len));
            }

            let mut body = Vec::with_capacity(len as usize);
            reader.by_ref().take(len).read_to_end(&mut body)?;
            if (body.len() as u64) < len {
                return Err(HttpError::UnexpectedEof);
            }
            req.body = body;
        }

        Ok(req)
    }

    /// Value of the first header called `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read a CRLF (or bare LF) terminated line, `None` at end of stream.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.by_ref().take(MAX_LINE_SIZE).read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(HttpError::UnexpectedEof);
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| HttpError::Header(String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: Some("application/json"),
            body,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain; charset=utf-8"),
            body: body.into().into_bytes(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write!(w, "HTTP/1.1 {} {}\r\n", self.status, reason(self.status))?;
        if let Some(content_type) = self.content_type {
            write!(w, "Content-Type: {}\r\n", content_type)?;
        }
        write!(w, "Content-Length: {}\r\n", self.body.len())?;
        write!(w, "Connection: close\r\n\r\n")?;
        w.write_all(&self.body)?;
        w.flush()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn it_should_read_request_with_body() {
        let raw = "POST /db/key1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 18\r\n\r\n{\"value\":\"value1\"}";
        let req = Request::read_from(&mut Cursor::new(raw)).unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/db/key1");
        assert_eq!(req.header("HOST"), Some("localhost"));
        assert_eq!(req.body, b"{\"value\":\"value1\"}");
    }

    #[test]
    fn it_should_read_request_without_body() {
        let raw = "GET /db/key1 HTTP/1.1\n\n";
        let req = Request::read_from(&mut Cursor::new(raw)).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.body.is_empty());
    }

    #[test]
    fn it_should_reject_malformed_requests() {
        let cases = [
            ("", "eof"),
            ("GET\r\n\r\n", "request line"),
            ("GET /db/a HTTP/1.1\r\nbroken\r\n\r\n", "header"),
            ("GET /db/a HTTP/1.1\r\nContent-Length: x\r\n\r\n", "length"),
            ("POST /db/a HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}", "short body"),
        ];

        for (raw, what) in cases {
            assert!(
                Request::read_from(&mut Cursor::new(raw)).is_err(),
                "{} should fail",
                what
            );
        }

        let raw = format!(
            "POST /db/a HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_SIZE + 1
        );
        assert!(matches!(
            Request::read_from(&mut Cursor::new(raw)),
            Err(HttpError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn it_should_write_response() {
        let mut out = Vec::new();
        Response::json(201, b"{}".to_vec()).write_to(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}"
        );
    }
}
