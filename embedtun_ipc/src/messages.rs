//! Control Protocol Messages
//!
//! This module defines the text messages exchanged on a tunnel's control
//! socket. A request is an operation line (`get=1` or `set=1`), followed for
//! `set` by `key=value` lines, and terminated by an empty line. A response is
//! a list of `key=value` lines closed by `errno=N` and an empty line.

use crate::transport::{IpcError, IpcResult};

/// Status code for a successful operation
pub const ERRNO_OK: i64 = 0;

/// Input/output failure inside the device
pub const ERRNO_IO: i64 = -5;

/// A `set` line was rejected
pub const ERRNO_INVALID: i64 = -22;

/// The operation line was not understood
pub const ERRNO_PROTOCOL: i64 = -71;

/// One `key=value` line of a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
    pub key: String,
    pub value: String,
}

impl ConfigLine {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a single `key=value` line
    pub fn parse(line: &str) -> IpcResult<Self> {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| IpcError::Protocol(format!("Line is not key=value: {:?}", line)))?;
        if key.is_empty() {
            return Err(IpcError::Protocol(format!("Empty key in line {:?}", line)));
        }
        Ok(Self::new(key, value))
    }
}

impl std::fmt::Display for ConfigLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Request sent by a control client to a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Dump the tunnel's current configuration
    Get,

    /// Apply configuration lines
    Set(Vec<ConfigLine>),
}

impl ControlRequest {
    /// Build a request from the raw lines of one message (without the
    /// terminating empty line)
    pub fn from_lines(lines: &[String]) -> IpcResult<Self> {
        let (op, body) = lines
            .split_first()
            .ok_or_else(|| IpcError::Protocol("Empty request".to_string()))?;

        match op.as_str() {
            "get=1" => {
                if !body.is_empty() {
                    return Err(IpcError::Protocol(
                        "get request must not carry a body".to_string(),
                    ));
                }
                Ok(ControlRequest::Get)
            }
            "set=1" => {
                let body = body
                    .iter()
                    .map(|line| ConfigLine::parse(line))
                    .collect::<IpcResult<Vec<_>>>()?;
                Ok(ControlRequest::Set(body))
            }
            other => Err(IpcError::UnknownOperation(other.to_string())),
        }
    }

    /// Encode the request including its terminating empty line
    pub fn encode(&self) -> String {
        match self {
            ControlRequest::Get => "get=1\n\n".to_string(),
            ControlRequest::Set(lines) => {
                let mut out = String::from("set=1\n");
                for line in lines {
                    out.push_str(&line.to_string());
                    out.push('\n');
                }
                out.push('\n');
                out
            }
        }
    }
}

/// Response sent by a tunnel to a control client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Body lines, empty for `set`
    pub lines: Vec<ConfigLine>,

    /// Zero on success, a negative errno otherwise
    pub errno: i64,
}

impl ControlResponse {
    pub fn ok(lines: Vec<ConfigLine>) -> Self {
        Self {
            lines,
            errno: ERRNO_OK,
        }
    }

    pub fn error(errno: i64) -> Self {
        Self {
            lines: Vec::new(),
            errno,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errno == ERRNO_OK
    }

    /// Build a response from the raw lines of one message. The final line
    /// must be the `errno` line.
    pub fn from_lines(lines: &[String]) -> IpcResult<Self> {
        let (last, body) = lines
            .split_last()
            .ok_or_else(|| IpcError::Protocol("Empty response".to_string()))?;

        let status = ConfigLine::parse(last)?;
        if status.key != "errno" {
            return Err(IpcError::Protocol(format!(
                "Response does not end with errno: {:?}",
                last
            )));
        }
        let errno = status
            .value
            .parse::<i64>()
            .map_err(|e| IpcError::Protocol(format!("Invalid errno {:?}: {}", status.value, e)))?;

        let lines = body
            .iter()
            .map(|line| ConfigLine::parse(line))
            .collect::<IpcResult<Vec<_>>>()?;

        Ok(Self { lines, errno })
    }

    /// Encode the response including its terminating empty line
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out.push_str(&format!("errno={}\n\n", self.errno));
        out
    }

    /// First value stored under `key`, if any
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| line.key == key)
            .map(|line| line.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_get_request() {
        let request = ControlRequest::from_lines(&lines(&["get=1"])).unwrap();
        assert_eq!(request, ControlRequest::Get);
        assert_eq!(request.encode(), "get=1\n\n");
    }

    #[test]
    fn parses_set_request_with_values_containing_equals() {
        let request = ControlRequest::from_lines(&lines(&[
            "set=1",
            "listen_port=51820",
            "endpoint=[::1]:51820",
            "odd=a=b",
        ]))
        .unwrap();

        match request {
            ControlRequest::Set(body) => {
                assert_eq!(body.len(), 3);
                assert_eq!(body[0], ConfigLine::new("listen_port", "51820"));
                assert_eq!(body[2].value, "a=b");
            }
            other => panic!("expected set, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = ControlRequest::from_lines(&lines(&["frobnicate=1"])).unwrap_err();
        assert!(matches!(err, IpcError::UnknownOperation(op) if op == "frobnicate=1"));
    }

    #[test]
    fn rejects_get_with_body() {
        assert!(ControlRequest::from_lines(&lines(&["get=1", "private_key=00"])).is_err());
    }

    #[test]
    fn response_requires_trailing_errno() {
        let ok = ControlResponse::from_lines(&lines(&["listen_port=1", "errno=0"])).unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.value("listen_port"), Some("1"));

        let failed = ControlResponse::from_lines(&lines(&["errno=-22"])).unwrap();
        assert_eq!(failed.errno, ERRNO_INVALID);

        assert!(ControlResponse::from_lines(&lines(&["listen_port=1"])).is_err());
    }

    #[test]
    fn response_encoding_ends_with_blank_line() {
        let response = ControlResponse::ok(vec![ConfigLine::new("listen_port", "51820")]);
        assert_eq!(response.encode(), "listen_port=51820\nerrno=0\n\n");
        assert_eq!(ControlResponse::error(ERRNO_IO).encode(), "errno=-5\n\n");
    }
}
