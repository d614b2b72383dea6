//! HTTP front door: `GET /db/{key}` and `POST /db/{key}` over a store.

use std::io::{BufReader, Write};
use std::net::TcpStream;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::store::error::StoreError;
use crate::store::Storage;
use crate::utils::http::{HttpError, Request, Response};

const DB_PREFIX: &str = "/db/";

/// Keys travel raw in the path, so URL syntax characters cannot be part of one.
pub const RESERVED_KEY_CHARS: [char; 3] = ['?', '#', '%'];

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct PutBody {
    value: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Translate one request into a store call.
pub fn route<S: Storage>(store: &S, req: &Request) -> Response {
    let path = req.path.as_str();

    let key = match path.strip_prefix(DB_PREFIX) {
        Some(key) => key,
        None if path == "/db" => "",
        None => return error_response(404, format!("no route for {}", path)),
    };

    match req.method.as_str() {
        "GET" => get(store, key),
        "POST" => put(store, key, &req.body),
        other => error_response(405, format!("method {} not allowed", other)),
    }
}

fn check_key(key: &str) -> Option<Response> {
    if key.is_empty() {
        return Some(error_response(400, "missing key"));
    }
    if key.contains(RESERVED_KEY_CHARS) {
        return Some(error_response(
            400,
            format!("key {:?} contains one of '?', '#', '%'", key),
        ));
    }
    None
}

fn get<S: Storage>(store: &S, key: &str) -> Response {
    if let Some(resp) = check_key(key) {
        return resp;
    }

    match store.get(key) {
        Ok(value) => {
            let kv = KeyValue {
                key: key.to_string(),
                value,
            };
            json_response(200, &kv)
        }
        Err(StoreError::KeyNotFound(_)) => error_response(404, format!("key {} not found", key)),
        Err(e) => store_error_response(e),
    }
}

fn put<S: Storage>(store: &S, key: &str, body: &[u8]) -> Response {
    if let Some(resp) = check_key(key) {
        return resp;
    }

    let body: PutBody = match serde_json::from_slice(body) {
        Ok(body) => body,
        Err(e) => return error_response(400, format!("invalid body: {}", e)),
    };

    match store.put(key, &body.value) {
        Ok(()) => Response::empty(201),
        Err(e) => store_error_response(e),
    }
}

fn store_error_response(e: StoreError) -> Response {
    if e.is_invalid_input() {
        return error_response(400, e.to_string());
    }

    error!("store request failed: {}", e);
    error_response(500, e.to_string())
}

fn json_response<T: Serialize>(status: u16, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(buf) => Response::json(status, buf),
        Err(e) => {
            error!("failed to encode response: {}", e);
            Response::empty(500)
        }
    }
}

fn error_response(status: u16, msg: impl Into<String>) -> Response {
    json_response(status, &ErrorBody { error: msg.into() })
}

/// Serve the single request on `stream`, then let the connection close.
pub fn handle_connection<S: Storage>(stream: TcpStream, store: &S) -> Result<(), HttpError> {
    let peer = stream.peer_addr()?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let resp = match Request::read_from(&mut reader) {
        Ok(req) => {
            let resp = route(store, &req);
            info!("{} {} {} -> {}", peer, req.method, req.path, resp.status);
            resp
        }
        Err(HttpError::Io(e)) => return Err(HttpError::Io(e)),
        Err(e) => {
            warn!("bad request from {}: {}", peer, e);
            error_response(400, e.to_string())
        }
    };

    resp.write_to(&mut writer)?;
    writer.flush()?;
    debug!("connection from {} done", peer);

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    use tempdir::TempDir;

    use super::*;
    use crate::store::{OpenOptions, Store};

    fn request(method: &str, path: &str, body: &str) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn error_of(resp: &Response) -> String {
        let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        v["error"].as_str().unwrap().to_string()
    }

    #[test]
    fn it_should_put_and_get() {
        let dir = TempDir::new("api-test").unwrap();
        let store = Store::open(dir.path()).unwrap();

        let resp = route(&store, &request("POST", "/db/key1", r#"{"value":"value1"}"#));
        assert_eq!(resp.status, 201);

        let resp = route(&store, &request("GET", "/db/key1", ""));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type, Some("application/json"));
        let kv: KeyValue = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(
            kv,
            KeyValue {
                key: "key1".to_string(),
                value: "value1".to_string()
            }
        );
    }

    #[test]
    fn it_should_map_errors_to_status() {
        let dir = TempDir::new("api-test").unwrap();
        let store = OpenOptions::new()
            .max_value_size(4)
            .open(dir.path())
            .unwrap();

        let cases = [
            (request("GET", "/db/missing", ""), 404),
            (request("GET", "/db/", ""), 400),
            (request("GET", "/db", ""), 400),
            (request("POST", "/db/", r#"{"value":"v"}"#), 400),
            (request("POST", "/db/key", "not json"), 400),
            (request("POST", "/db/key", r#"{"other":"v"}"#), 400),
            (request("POST", "/db/key", r#"{"value":"too long"}"#), 400),
            (request("POST", "/db/a?b", r#"{"value":"v"}"#), 400),
            (request("GET", "/db/a%20b", ""), 400),
            (request("GET", "/db/a#b", ""), 400),
            (request("DELETE", "/db/key", ""), 405),
            (request("GET", "/other", ""), 404),
        ];

        for (req, status) in cases {
            let resp = route(&store, &req);
            assert_eq!(resp.status, status, "{} {}", req.method, req.path);
            assert!(!error_of(&resp).is_empty());
        }
    }

    #[test]
    fn it_should_not_store_under_truncated_key() {
        let dir = TempDir::new("api-test").unwrap();
        let store = Store::open(dir.path()).unwrap();

        let resp = route(&store, &request("POST", "/db/a?b", r#"{"value":"v"}"#));
        assert_eq!(resp.status, 400);
        assert!(matches!(store.get("a"), Err(StoreError::KeyNotFound(_))));
        assert!(matches!(store.get("a?b"), Err(StoreError::KeyNotFound(_))));
    }

    #[test]
    fn it_should_return_500_after_close() {
        let dir = TempDir::new("api-test").unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.close().unwrap();

        let resp = route(&store, &request("GET", "/db/key", ""));
        assert_eq!(resp.status, 500);
        assert_eq!(error_of(&resp), StoreError::Closed.to_string());
    }

    #[test]
    fn it_should_serve_a_connection() {
        let dir = TempDir::new("api-test").unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put("key1", "value1").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = {
            let store = store.clone();
            thread::spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                handle_connection(stream, &store).unwrap();
            })
        };

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(b"GET /db/key1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut raw = String::new();
        client.read_to_string(&mut raw).unwrap();
        server.join().unwrap();

        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"), "got {}", raw);
        assert!(raw.contains("Connection: close\r\n"));
        assert!(raw.ends_with(r#"{"key":"key1","value":"value1"}"#));
    }
}
