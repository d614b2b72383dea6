use std::io::{self, prelude::*, BufReader, Write};
use std::net::TcpStream;

use clap::Parser;
use log::debug;
use thiserror::Error;

/// Interactive client for the segdb service.
#[derive(Parser, Debug)]
#[command(name = "segdb-cli")]
#[command(version)]
struct Args {
    /// Service address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:8083")]
    addr: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("malformed response: {0}")]
    Response(String),

    #[error("key {0:?} must not contain '?', '#' or '%'")]
    InvalidKey(String),
}

type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Get(&'a str),
    Set(&'a str, &'a str),
    Help,
    Exit,
    Empty,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    match cmd {
        "" => Command::Empty,
        "help" => Command::Help,
        "exit" | "quit" => Command::Exit,
        "get" if !rest.is_empty() && !rest.contains(char::is_whitespace) => Command::Get(rest),
        "set" => match rest.split_once(char::is_whitespace) {
            // the value is everything after the key.
            Some((key, value)) => Command::Set(key, value.trim_start()),
            None => Command::Unknown(line),
        },
        _ => Command::Unknown(line),
    }
}

fn help() {
    println!("help -- show help");
    println!("get  -- get key value, by: <key>");
    println!("set  -- set key value, by: <key> <value>");
    println!("exit -- exit command");
}

/// Status code and body of a response.
#[derive(Debug, PartialEq, Eq)]
struct Reply {
    status: u16,
    body: String,
}

fn parse_response(raw: &[u8]) -> Result<Reply> {
    let raw = String::from_utf8_lossy(raw);
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .ok_or_else(|| CliError::Response("missing header terminator".to_string()))?;

    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CliError::Response(status_line.to_string()))?;

    Ok(Reply {
        status,
        body: body.to_string(),
    })
}

/// The service takes keys raw from the path, so URL syntax is off limits.
fn check_key(key: &str) -> Result<()> {
    if key.contains(['?', '#', '%']) {
        return Err(CliError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn request(addr: &str, method: &str, key: &str, body: Option<String>) -> Result<Reply> {
    check_key(key)?;
    let mut stream = TcpStream::connect(addr)?;

    let body = body.unwrap_or_default();
    write!(
        stream,
        "{} /db/{} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        key,
        addr,
        body.len(),
        body
    )?;
    stream.flush()?;

    let mut raw = Vec::new();
    BufReader::new(&stream).read_to_end(&mut raw)?;
    debug!("{} /db/{} -> {} bytes", method, key, raw.len());

    parse_response(&raw)
}

/// Error message out of a JSON error body, or the body itself.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn get(addr: &str, key: &str) -> Result<String> {
    let reply = request(addr, "GET", key, None)?;
    match reply.status {
        200 => {
            let v: serde_json::Value = serde_json::from_str(&reply.body)?;
            v["value"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CliError::Response(reply.body.clone()))
        }
        404 => Ok("(nil)".to_string()),
        status => Ok(format!("error {}: {}", status, error_message(&reply.body))),
    }
}

fn set(addr: &str, key: &str, value: &str) -> Result<String> {
    let body = serde_json::json!({ "value": value }).to_string();
    let reply = request(addr, "POST", key, Some(body))?;
    match reply.status {
        201 => Ok("OK".to_string()),
        status => Ok(format!("error {}: {}", status, error_message(&reply.body))),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        stdout.write_all("> ".as_bytes())?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }

        let out = match parse_command(&line) {
            Command::Empty => continue,
            Command::Exit => break,
            Command::Help => {
                help();
                continue;
            }
            Command::Get(key) => get(&args.addr, key),
            Command::Set(key, value) => set(&args.addr, key, value),
            Command::Unknown(cmd) => Ok(format!("unknown command: {}, try `help`", cmd)),
        };

        match out {
            Ok(out) => println!("{}", out),
            Err(e) => eprintln!("{}", e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_parse_commands() {
        assert_eq!(parse_command("get key1\n"), Command::Get("key1"));
        assert_eq!(
            parse_command("set key1  hello world\n"),
            Command::Set("key1", "hello world")
        );
        assert_eq!(parse_command("help"), Command::Help);
        assert_eq!(parse_command("exit\n"), Command::Exit);
        assert_eq!(parse_command("  \n"), Command::Empty);
        assert_eq!(parse_command("get"), Command::Unknown("get"));
        assert_eq!(parse_command("get a b"), Command::Unknown("get a b"));
        assert_eq!(parse_command("set key1"), Command::Unknown("set key1"));
        assert_eq!(parse_command("ls"), Command::Unknown("ls"));
    }

    #[test]
    fn it_should_parse_responses() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 31\r\n\r\n{\"key\":\"key1\",\"value\":\"value1\"}";
        let reply = parse_response(raw).unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, r#"{"key":"key1","value":"value1"}"#);

        let reply = parse_response(b"HTTP/1.1 201 Created\r\n\r\n").unwrap();
        assert_eq!(reply.status, 201);
        assert!(reply.body.is_empty());

        assert!(parse_response(b"garbage").is_err());
        assert!(parse_response(b"HTTP/1.1 abc\r\n\r\n").is_err());
    }

    #[test]
    fn it_should_reject_keys_with_url_syntax() {
        assert!(check_key("key1").is_ok());
        for key in ["a?b", "a#b", "a%20b"] {
            assert!(matches!(check_key(key), Err(CliError::InvalidKey(_))));
        }

        // refused before any connection is attempted.
        let res = set("127.0.0.1:1", "a?b", "v");
        assert!(matches!(res, Err(CliError::InvalidKey(_))));
    }

    #[test]
    fn it_should_extract_error_messages() {
        assert_eq!(error_message(r#"{"error":"key is too large"}"#), "key is too large");
        assert_eq!(error_message("plain"), "plain");
    }
}
