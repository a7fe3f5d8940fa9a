//! Request decoding.
//!
//! Wire shape: `TOKEN:<token> <COMMAND> <arguments>`. Anything that does not
//! match still decodes; the token is simply absent and middleware decides
//! what to do with it.

use std::time::Instant;

/// Prefix carrying the client's shared secret.
pub const TOKEN_PREFIX: &str = "TOKEN:";

/// A decoded request, alive for one pipeline execution.
///
/// Fields are public so middleware can rewrite the request before dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    /// Originating connection.
    pub conn_id: usize,
    /// Full request line with the trailing line ending removed.
    pub raw: String,
    /// Token from the `TOKEN:` prefix, if present and non-empty.
    pub token: Option<String>,
    /// Command keyword as sent by the client.
    pub command: String,
    /// Free-text remainder after the command, verbatim.
    pub arguments: String,
    /// When the bytes came off the socket.
    pub received_at: Instant,
}

impl Request {
    /// Decode raw bytes read from a connection.
    pub fn decode(conn_id: usize, bytes: &[u8], received_at: Instant) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end_matches(['\r', '\n']);

        let (token, body) = match line.strip_prefix(TOKEN_PREFIX) {
            Some(after) => match after.split_once(char::is_whitespace) {
                Some((token, rest)) => (token, rest.trim_start()),
                None => (after, ""),
            },
            None => ("", line),
        };

        let (command, arguments) = body.split_once(' ').unwrap_or((body, ""));

        Self {
            conn_id,
            raw: line.to_string(),
            token: (!token.is_empty()).then(|| token.to_string()),
            command: command.to_string(),
            arguments: arguments.to_string(),
            received_at,
        }
    }

    /// Convenience constructor for building requests outside the runtime.
    pub fn from_line(line: &str) -> Self {
        Self::decode(0, line.as_bytes(), Instant::now())
    }

    /// Case-insensitive command match.
    pub fn is_command(&self, command: &str) -> bool {
        self.command.eq_ignore_ascii_case(command)
    }
}
