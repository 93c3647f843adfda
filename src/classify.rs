//! Classification of the first chunk a client sends.
//!
//! Only the request line (for `CONNECT`) or the header block (for everything
//! else) is inspected, and only within the single chunk already read. Lines
//! split across reads are not reassembled.

use std::fmt;

use thiserror::Error;

pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Longest host accepted from a request; longer values are cut silently.
pub const MAX_HOST_LEN: usize = 255;

const CONNECT_METHOD: &[u8] = b"CONNECT";
const HOST_HEADER: &[u8] = b"Host:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    /// `CONNECT host[:port] ...`, relayed opaquely once the origin is up.
    Tunnel(Target),
    /// Any other method. `raw` is the whole chunk, forwarded untouched.
    Forward { target: Target, raw: &'a [u8] },
}

impl Request<'_> {
    pub fn target(&self) -> &Target {
        match self {
            Request::Tunnel(target) => target,
            Request::Forward { target, .. } => target,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("request line is not newline-terminated")]
    UnterminatedRequestLine,
    #[error("CONNECT request has no authority")]
    MissingAuthority,
    #[error("invalid port in CONNECT authority: {0:?}")]
    InvalidPort(String),
    #[error("no Host header")]
    MissingHost,
}

pub fn classify(chunk: &[u8]) -> Result<Request<'_>, ParseError> {
    if chunk.is_empty() {
        return Err(ParseError::Empty);
    }

    match chunk.strip_prefix(CONNECT_METHOD) {
        Some(rest) if rest.first().is_some_and(|&b| is_blank(b)) => parse_connect(rest),
        _ => parse_forward(chunk),
    }
}

fn parse_connect(rest: &[u8]) -> Result<Request<'static>, ParseError> {
    let line = first_line(rest).ok_or(ParseError::UnterminatedRequestLine)?;
    let line = trim_start_blank(line);

    // The authority has to be followed by the rest of the request line.
    let end = line
        .iter()
        .position(|&b| is_blank(b))
        .ok_or(ParseError::MissingAuthority)?;
    let authority = &line[..end];

    let (host, port) = match authority.iter().position(|&b| b == b':') {
        Some(colon) => (&authority[..colon], parse_port(&authority[colon + 1..])?),
        None => (authority, DEFAULT_HTTPS_PORT),
    };

    if host.is_empty() {
        return Err(ParseError::MissingAuthority);
    }

    Ok(Request::Tunnel(Target {
        host: bounded_host(host),
        port,
    }))
}

fn parse_forward(chunk: &[u8]) -> Result<Request<'_>, ParseError> {
    let mut lines = complete_lines(chunk);
    // Request line.
    lines.next().ok_or(ParseError::UnterminatedRequestLine)?;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some(value) = line.strip_prefix(HOST_HEADER) else {
            continue;
        };

        let value = trim_start_blank(value);
        let value = value
            .iter()
            .position(|&b| b == 0)
            .map_or(value, |nul| &value[..nul]);
        let value = &value[..value.len().min(MAX_HOST_LEN)];

        // A `:port` suffix is not honored here; plain HTTP always goes to 80.
        let host = value
            .iter()
            .position(|&b| b == b':')
            .map_or(value, |colon| &value[..colon]);

        if host.is_empty() {
            return Err(ParseError::MissingHost);
        }

        return Ok(Request::Forward {
            target: Target {
                host: String::from_utf8_lossy(host).into_owned(),
                port: DEFAULT_HTTP_PORT,
            },
            raw: chunk,
        });
    }

    Err(ParseError::MissingHost)
}

fn parse_port(raw: &[u8]) -> Result<u16, ParseError> {
    let invalid = || ParseError::InvalidPort(String::from_utf8_lossy(raw).into_owned());
    let port: u16 = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    if port == 0 {
        return Err(invalid());
    }
    Ok(port)
}

fn bounded_host(raw: &[u8]) -> String {
    String::from_utf8_lossy(&raw[..raw.len().min(MAX_HOST_LEN)]).into_owned()
}

/// The first newline-terminated line, without its line ending.
fn first_line(buf: &[u8]) -> Option<&[u8]> {
    complete_lines(buf).next()
}

/// Newline-terminated lines with `\r\n` / `\n` stripped. A trailing partial
/// line is not yielded.
fn complete_lines(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.split_inclusive(|&b| b == b'\n')
        .filter_map(|line| line.strip_suffix(b"\n"))
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn trim_start_blank(buf: &[u8]) -> &[u8] {
    let start = buf.iter().position(|&b| !is_blank(b)).unwrap_or(buf.len());
    &buf[start..]
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}
