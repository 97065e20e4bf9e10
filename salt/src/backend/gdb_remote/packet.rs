//! GDB Remote Serial Protocol framing
//!
//! `$<payload>#<checksum>` packets, `+`/`-` acknowledgements, `}` escapes and
//! `*` run-length encoding, plus stop-reply parsing.

use crate::domain::BackendError;

/// Raw interrupt byte (Ctrl-C) understood by every stub
pub const INTERRUPT: u8 = 0x03;

#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame a command payload, escaping reserved characters
#[must_use]
pub fn encode(payload: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len());
    for &b in payload.as_bytes() {
        if matches!(b, b'$' | b'#' | b'}' | b'*') {
            body.push(b'}');
            body.push(b ^ 0x20);
        } else {
            body.push(b);
        }
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(b'$');
    out.extend_from_slice(&body);
    out.push(b'#');
    out.extend_from_slice(format!("{:02x}", checksum(&body)).as_bytes());
    out
}

/// One unit received from the stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    /// Decoded payload (escapes and run-length encoding expanded)
    Packet(Vec<u8>),
    /// Packet whose checksum did not verify; must be nacked
    Corrupt,
}

#[derive(Debug, Default, Clone, Copy)]
enum State {
    #[default]
    Idle,
    Body,
    Checksum(Option<u8>),
}

/// Incremental decoder for the byte stream coming from the stub
#[derive(Debug, Default)]
pub struct PacketReader {
    state: State,
    body: Vec<u8>,
}

impl PacketReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes, returning every frame they complete
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for &b in bytes {
            match self.state {
                State::Idle => match b {
                    b'+' => frames.push(Frame::Ack),
                    b'-' => frames.push(Frame::Nack),
                    b'$' => {
                        self.body.clear();
                        self.state = State::Body;
                    }
                    _ => {}
                },
                State::Body => {
                    if b == b'#' {
                        self.state = State::Checksum(None);
                    } else {
                        self.body.push(b);
                    }
                }
                State::Checksum(None) => self.state = State::Checksum(Some(b)),
                State::Checksum(Some(high)) => {
                    self.state = State::Idle;
                    let expected = hex_digit(high)
                        .zip(hex_digit(b))
                        .map(|(h, l)| (h << 4) | l);
                    if expected == Some(checksum(&self.body)) {
                        frames.push(Frame::Packet(expand(&self.body)));
                    } else {
                        frames.push(Frame::Corrupt);
                    }
                }
            }
        }
        frames
    }
}

/// Undo `}` escapes and `*` run-length encoding
fn expand(body: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(b) = iter.next() {
        match b {
            b'}' => {
                if let Some(next) = iter.next() {
                    out.push(next ^ 0x20);
                }
            }
            b'*' => {
                if let (Some(count), Some(&last)) = (iter.next(), out.last()) {
                    let repeat = usize::from(count.saturating_sub(29));
                    out.extend(std::iter::repeat(last).take(repeat));
                }
            }
            _ => out.push(b),
        }
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode a hex payload into bytes
///
/// # Errors
/// `BackendError::Protocol` on odd length or non-hex characters
pub fn decode_hex(payload: &[u8]) -> Result<Vec<u8>, BackendError> {
    if payload.len() % 2 != 0 {
        return Err(BackendError::Protocol(format!("odd-length hex reply ({} chars)", payload.len())));
    }
    payload
        .chunks(2)
        .map(|pair| {
            hex_digit(pair[0])
                .zip(hex_digit(pair[1]))
                .map(|(h, l)| (h << 4) | l)
                .ok_or_else(|| BackendError::Protocol("non-hex character in reply".into()))
        })
        .collect()
}

/// `Exx` error reply
#[must_use]
pub fn is_error_reply(payload: &[u8]) -> bool {
    payload.len() == 3 && payload[0] == b'E'
}

/// Why the target stopped, as reported by the stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    /// `S`/`T` packet with the signal number
    Signal(u8),
    /// `W` packet: target exited with a status
    Exited(u8),
    /// `X` packet: target terminated by a signal
    Terminated(u8),
    /// `O` packet: console output from the stub
    Output(String),
}

/// # Errors
/// `BackendError::Protocol` for anything that is not a stop reply
pub fn parse_stop_reply(payload: &[u8]) -> Result<StopReply, BackendError> {
    let (&kind, rest) = payload
        .split_first()
        .ok_or_else(|| BackendError::Protocol("empty stop reply".into()))?;
    let code = || -> Result<u8, BackendError> {
        rest.get(..2)
            .and_then(|digits| decode_hex(digits).ok())
            .and_then(|bytes| bytes.first().copied())
            .ok_or_else(|| {
                BackendError::Protocol(format!("bad stop reply {}", String::from_utf8_lossy(payload)))
            })
    };
    match kind {
        b'S' | b'T' => Ok(StopReply::Signal(code()?)),
        b'W' => Ok(StopReply::Exited(code()?)),
        b'X' => Ok(StopReply::Terminated(code()?)),
        b'O' => {
            let text = decode_hex(rest)?;
            Ok(StopReply::Output(String::from_utf8_lossy(&text).into_owned()))
        }
        _ => Err(BackendError::Protocol(format!(
            "unexpected stop reply {}",
            String::from_utf8_lossy(payload)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_checksum() {
        assert_eq!(encode("g"), b"$g#67".to_vec());
        assert_eq!(encode("m0,8"), b"$m0,8#01".to_vec());
    }

    #[test]
    fn test_encode_escapes_reserved() {
        let framed = encode("a#b");
        assert_eq!(&framed[..5], b"$a}\x03b");
    }

    #[test]
    fn test_reader_splits_ack_and_packet() {
        let mut reader = PacketReader::new();
        let frames = reader.feed(b"+$OK#9a");
        assert_eq!(frames, vec![Frame::Ack, Frame::Packet(b"OK".to_vec())]);
    }

    #[test]
    fn test_reader_across_reads() {
        let mut reader = PacketReader::new();
        assert!(reader.feed(b"$O").is_empty());
        assert!(reader.feed(b"K#9").is_empty());
        assert_eq!(reader.feed(b"a"), vec![Frame::Packet(b"OK".to_vec())]);
    }

    #[test]
    fn test_reader_flags_bad_checksum() {
        let mut reader = PacketReader::new();
        assert_eq!(reader.feed(b"$OK#00"), vec![Frame::Corrupt]);
    }

    #[test]
    fn test_run_length_expansion() {
        // "0* " is '0' repeated 1 + (b' ' - 29) = 4 times
        assert_eq!(expand(b"0* "), b"0000".to_vec());
        assert_eq!(expand(b"}]"), b"}".to_vec());
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex(b"00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert!(decode_hex(b"0").is_err());
        assert!(decode_hex(b"zz").is_err());
    }

    #[test]
    fn test_parse_stop_replies() {
        assert_eq!(parse_stop_reply(b"S05").unwrap(), StopReply::Signal(5));
        assert_eq!(parse_stop_reply(b"T05thread:01;").unwrap(), StopReply::Signal(5));
        assert_eq!(parse_stop_reply(b"W00").unwrap(), StopReply::Exited(0));
        assert_eq!(parse_stop_reply(b"O6869").unwrap(), StopReply::Output("hi".into()));
        assert!(parse_stop_reply(b"OK").is_err());
    }

    #[test]
    fn test_error_reply() {
        assert!(is_error_reply(b"E14"));
        assert!(!is_error_reply(b"e1"));
    }
}
