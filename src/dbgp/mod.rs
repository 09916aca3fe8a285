//! DBGp wire codec: `<length>\0<xml>\0` framing for engine-to-IDE packets,
//! NUL-terminated command lines for IDE-to-engine traffic, and the command
//! line parser.

pub mod xml;

use crate::engine::Direction;
use crate::engine::error::Error;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;
use std::io::BufRead;

/// Wrap a response body into a DBGp frame.
pub fn frame(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.push(0);
    out.extend_from_slice(body.as_bytes());
    out.push(0);
    out
}

/// Decode one engine frame from a buffer, returning the body and the rest of
/// the buffer. Fails with an ide-protocol-error on a bad length header.
pub fn unframe(buf: &[u8]) -> Result<(String, &[u8]), Error> {
    let len_end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::IdeProtocol("frame has no length terminator".into()))?;
    let len: usize = std::str::from_utf8(&buf[..len_end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::IdeProtocol("frame length is not a number".into()))?;

    let body_start = len_end + 1;
    if buf.len() < body_start + len + 1 {
        return Err(Error::IdeProtocol(format!(
            "frame declares {len} bytes but only {} are present",
            buf.len().saturating_sub(body_start + 1),
        )));
    }
    if buf[body_start + len] != 0 {
        return Err(Error::IdeProtocol("frame body not NUL-terminated".into()));
    }

    let body = String::from_utf8(buf[body_start..body_start + len].to_vec())?;
    Ok((body, &buf[body_start + len + 1..]))
}

/// Read one NUL-terminated command from the IDE. `Ok(None)` on clean EOF.
pub fn read_command(reader: &mut impl BufRead) -> Result<Option<String>, Error> {
    let mut raw = Vec::new();
    let n = reader.read_until(0, &mut raw)?;
    if n == 0 {
        return Ok(None);
    }
    if raw.last() != Some(&0) {
        return Err(Error::IdeProtocol(
            "command not NUL-terminated before connection closed".into(),
        ));
    }
    raw.pop();
    Ok(Some(String::from_utf8(raw)?))
}

/// Read one `<length>\0<xml>\0` frame coming *from* a debugger engine. Used by
/// the recording-side DBGp client. `Ok(None)` on clean EOF.
pub fn read_frame(reader: &mut impl BufRead) -> Result<Option<String>, Error> {
    let mut len_buf = Vec::new();
    if reader.read_until(0, &mut len_buf)? == 0 {
        return Ok(None);
    }
    if len_buf.last() != Some(&0) {
        return Err(Error::IdeProtocol("frame has no length terminator".into()));
    }
    len_buf.pop();
    let len: usize = std::str::from_utf8(&len_buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::IdeProtocol("frame length is not a number".into()))?;

    let mut body = vec![0u8; len + 1];
    reader.read_exact(&mut body)?;
    if body.pop() != Some(0) {
        return Err(Error::IdeProtocol("frame body not NUL-terminated".into()));
    }
    Ok(Some(String::from_utf8(body)?))
}

/// A parsed DBGp command line, e.g. `breakpoint_set -i 4 -t line -f file:///a.php -n 10`.
#[derive(Debug, Clone)]
pub struct DbgpCommand {
    pub verb: String,
    pub seq: u64,
    pub options: HashMap<char, String>,
    /// Raw base64 payload after `--`, decoded on demand.
    pub data: Option<String>,
    /// Execution direction captured when the command was parsed.
    pub direction: Direction,
    /// The original command line, forwarded verbatim by diversion sessions.
    pub raw: String,
}

impl DbgpCommand {
    pub fn parse(line: &str, direction: Direction) -> Result<DbgpCommand, Error> {
        let (head, data) = match line.split_once(" -- ") {
            Some((head, data)) => (head, Some(data.trim().to_string())),
            None => (line, None),
        };

        let mut tokens = head.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| Error::IdeProtocol("empty command".into()))?
            .to_string();

        let mut options = HashMap::new();
        while let Some(token) = tokens.next() {
            let key = match token.strip_prefix('-') {
                Some(key) if key.len() == 1 => key.chars().next().expect("len checked"),
                _ => {
                    return Err(Error::IdeProtocol(format!(
                        "unexpected token `{token}` in: {line}"
                    )));
                }
            };
            let value = tokens.next().ok_or_else(|| {
                Error::IdeProtocol(format!("option -{key} has no value in: {line}"))
            })?;
            options.insert(key, value.to_string());
        }

        let seq = options
            .remove(&'i')
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::IdeProtocol(format!("missing -i sequence in: {line}")))?;

        Ok(DbgpCommand {
            verb,
            seq,
            options,
            data,
            direction,
            raw: line.to_string(),
        })
    }

    pub fn option(&self, key: char) -> Option<&str> {
        self.options.get(&key).map(String::as_str)
    }

    /// Base64-decode the `--` payload.
    pub fn decoded_data(&self) -> Result<String, Error> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| Error::IdeProtocol(format!("{}: missing -- data", self.verb)))?;
        Ok(String::from_utf8(BASE64.decode(data)?)?)
    }
}
