//! Line protocol shared by the server and the client.
//!
//! Newline-delimited text over a reliable byte stream:
//!
//! ```text
//! Request:  PING\n
//! Response: PONG\n
//!
//! Request:  hello\n
//! Response: ECHO: hello\n
//! ```
//!
//! There is no open/close handshake. Disconnection is only ever signaled by
//! the socket closing. Heartbeat replies are told apart from application
//! replies purely by their literal content, so correctness relies on the
//! stream preserving line boundaries and FIFO order.

use bytes::BytesMut;

/// Heartbeat probe sent by the client.
pub const PING: &str = "PING";

/// Heartbeat reply sent by the server.
pub const PONG: &str = "PONG";

/// Tag prepended to every echoed payload line.
pub const ECHO_TAG: &str = "ECHO: ";

/// Heartbeat frame as written on the wire.
pub const PING_FRAME: &[u8] = b"PING\n";

/// A request line received by the server.
///
/// Lines are raw bytes: the protocol never requires UTF-8, so payload is
/// echoed exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// Liveness probe.
    Ping,
    /// Anything else, echoed back verbatim.
    Payload(&'a [u8]),
}

/// A reply line received by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<'a> {
    /// Heartbeat reply. Never surfaced to callers.
    Pong,
    /// Application data.
    Data(&'a [u8]),
}

/// Strip a single trailing `\n` and an optional `\r` before it.
pub fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Classify a raw request line (terminator included or not).
///
/// Only a line that is exactly `PING` once surrounding whitespace is removed
/// counts as a heartbeat. Lower case, trailing arguments and other near
/// misses are ordinary payload.
pub fn classify_request(line: &[u8]) -> Request<'_> {
    if line.trim_ascii() == PING.as_bytes() {
        Request::Ping
    } else {
        Request::Payload(strip_line_ending(line))
    }
}

/// Classify a reply line as seen by the client.
pub fn classify_reply(line: &[u8]) -> Reply<'_> {
    let line = strip_line_ending(line);
    if line == PONG.as_bytes() {
        Reply::Pong
    } else {
        Reply::Data(line)
    }
}

/// Encode the server's reply to a request.
pub fn encode_reply(request: &Request<'_>) -> BytesMut {
    match request {
        Request::Ping => BytesMut::from("PONG\n"),
        Request::Payload(payload) => {
            let mut resp = BytesMut::with_capacity(ECHO_TAG.len() + payload.len() + 1);
            resp.extend_from_slice(ECHO_TAG.as_bytes());
            resp.extend_from_slice(payload);
            resp.extend_from_slice(b"\n");
            resp
        }
    }
}

/// Encode an application message as a single line.
///
/// Embedded line terminators would split the message into several requests
/// and break the one-reply-per-line pairing, so they are replaced by spaces.
pub fn encode_line(message: &str) -> BytesMut {
    let mut line = BytesMut::with_capacity(message.len() + 1);
    for (i, chunk) in message.split(['\r', '\n']).enumerate() {
        if i > 0 {
            line.extend_from_slice(b" ");
        }
        line.extend_from_slice(chunk.as_bytes());
    }
    line.extend_from_slice(b"\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ping() {
        assert_eq!(classify_request(b"PING\n"), Request::Ping);
        assert_eq!(classify_request(b"PING\r\n"), Request::Ping);
        assert_eq!(classify_request(b"  PING \t\n"), Request::Ping);
        assert_eq!(classify_request(b"PING"), Request::Ping);
    }

    #[test]
    fn test_malformed_heartbeats_are_payload() {
        assert_eq!(classify_request(b"ping\n"), Request::Payload(b"ping"));
        assert_eq!(classify_request(b"PING x\n"), Request::Payload(b"PING x"));
        assert_eq!(classify_request(b"PINGPING\n"), Request::Payload(b"PINGPING"));
        assert_eq!(classify_request(b"PONG\n"), Request::Payload(b"PONG"));
    }

    #[test]
    fn test_payload_strips_only_line_ending() {
        assert_eq!(classify_request(b"hello\r\n"), Request::Payload(b"hello"));
        assert_eq!(classify_request(b" spaced \n"), Request::Payload(b" spaced "));
        assert_eq!(classify_request(b"\n"), Request::Payload(b""));
    }

    #[test]
    fn test_non_utf8_payload_is_kept() {
        assert_eq!(classify_request(b"caf\xe9\n"), Request::Payload(b"caf\xe9"));
        assert_eq!(
            &encode_reply(&classify_request(b"\xff\xfe\r\n"))[..],
            b"ECHO: \xff\xfe\n"
        );
        assert_eq!(classify_reply(b"ECHO: caf\xe9\n"), Reply::Data(b"ECHO: caf\xe9"));
    }

    #[test]
    fn test_encode_reply() {
        assert_eq!(&encode_reply(&Request::Ping)[..], b"PONG\n");
        assert_eq!(&encode_reply(&Request::Payload(b"hello"))[..], b"ECHO: hello\n");
        assert_eq!(&encode_reply(&Request::Payload(b""))[..], b"ECHO: \n");
    }

    #[test]
    fn test_classify_reply() {
        assert_eq!(classify_reply(b"PONG\n"), Reply::Pong);
        assert_eq!(classify_reply(b"PONG"), Reply::Pong);
        assert_eq!(classify_reply(b"ECHO: PONG\n"), Reply::Data(b"ECHO: PONG"));
        assert_eq!(classify_reply(b"ECHO: hi\r\n"), Reply::Data(b"ECHO: hi"));
    }

    #[test]
    fn test_encode_line() {
        assert_eq!(&encode_line("hello")[..], b"hello\n");
        assert_eq!(&encode_line("a\r\nb")[..], b"a  b\n");
        assert_eq!(&encode_line("")[..], b"\n");
    }
}
