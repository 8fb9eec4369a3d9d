use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Numeric handle assigned to a connection at accept time; the addressing
/// unit for routing. `0` is never assigned and means "no destination
/// chosen yet" on the client side.
pub type Identity = u64;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

const KIND_CLIENT_LIST: u8 = 0;
const KIND_NEW_CLIENT: u8 = 1;
const KIND_REGULAR: u8 = 2;
const KIND_SERVER_HELLO: u8 = 3;

/// One decoded line of the wire protocol.
///
/// Every frame travels as `<kind>:<payload>\n` with a decimal kind tag.
/// Free text is not escaped; parsing always splits on the leftmost
/// separator so text containing `:` or `-` still round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `0:<id>-<id>-...-` — identities currently connected, each followed
    /// by a `-`.
    ClientList(Vec<Identity>),
    /// `1:<id>` — a peer joined.
    NewClient(Identity),
    /// `2:<sender>-<text>` — a message routed from `sender`.
    Regular { sender: Identity, text: String },
    /// `3:<id>` — the identity assigned to the receiving connection.
    ServerHello(Identity),
}

/// Why a line failed to decode. Malformed lines are dropped by whoever
/// decoded them; they never take a connection down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("missing {0:?} separator")]
    MissingSeparator(char),
    #[error("frame kind is not numeric: {0:?}")]
    InvalidKind(String),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("identity field is not a decimal integer: {0:?}")]
    InvalidIdentity(String),
    #[error("line truncated before its newline terminator")]
    Truncated,
}

impl Frame {
    pub fn encode(&self) -> String {
        match self {
            Frame::ClientList(identities) => {
                let mut line = format!("{KIND_CLIENT_LIST}:");
                for identity in identities {
                    line.push_str(&identity.to_string());
                    line.push('-');
                }
                line
            }
            Frame::NewClient(identity) => format!("{KIND_NEW_CLIENT}:{identity}"),
            Frame::Regular { sender, text } => format!("{KIND_REGULAR}:{sender}-{text}"),
            Frame::ServerHello(identity) => format!("{KIND_SERVER_HELLO}:{identity}"),
        }
    }

    pub fn decode(line: &str) -> Result<Self, FrameError> {
        let (kind, payload) = line
            .split_once(':')
            .ok_or(FrameError::MissingSeparator(':'))?;
        let kind: u8 = kind
            .parse()
            .map_err(|_| FrameError::InvalidKind(kind.to_string()))?;

        match kind {
            KIND_CLIENT_LIST => {
                let identities = payload
                    .split('-')
                    .filter(|part| !part.is_empty())
                    .map(parse_identity)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Frame::ClientList(identities))
            }
            KIND_NEW_CLIENT => Ok(Frame::NewClient(parse_identity(payload)?)),
            KIND_REGULAR => {
                let (sender, text) = payload
                    .split_once('-')
                    .ok_or(FrameError::MissingSeparator('-'))?;
                Ok(Frame::Regular {
                    sender: parse_identity(sender)?,
                    text: text.to_string(),
                })
            }
            KIND_SERVER_HELLO => Ok(Frame::ServerHello(parse_identity(payload)?)),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Parses a client's `<destination>:<text>` routing line.
pub fn parse_route(line: &str) -> Result<(Identity, &str), FrameError> {
    let (destination, text) = line
        .split_once(':')
        .ok_or(FrameError::MissingSeparator(':'))?;
    Ok((parse_identity(destination)?, text))
}

pub fn encode_route(destination: Identity, text: &str) -> String {
    format!("{destination}:{text}")
}

fn parse_identity(field: &str) -> Result<Identity, FrameError> {
    field
        .parse()
        .map_err(|_| FrameError::InvalidIdentity(field.to_string()))
}

/// Reads one newline-terminated line, skipping blank ones.
///
/// Returns `Ok(None)` on clean end-of-stream. Bytes left dangling without
/// a terminator when the stream ends are an error, not a short line.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            return Err(to_io_error(FrameError::Truncated));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await? {
        Some(line) => Ok(Some(Frame::decode(&line).map_err(to_io_error)?)),
        None => Ok(None),
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, &frame.encode()).await
}

pub async fn write_route<W>(writer: &mut W, destination: Identity, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, &encode_route(destination, text)).await
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Append the newline delimiter and flush so peers get timely delivery.
    let mut encoded = line.as_bytes().to_vec();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: FrameError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_each_kind() {
        assert_eq!(Frame::ClientList(vec![2, 3, 5]).encode(), "0:2-3-5-");
        assert_eq!(Frame::NewClient(3).encode(), "1:3");
        assert_eq!(
            Frame::Regular {
                sender: 5,
                text: "hi".into()
            }
            .encode(),
            "2:5-hi"
        );
        assert_eq!(Frame::ServerHello(2).encode(), "3:2");
    }

    #[test]
    fn decodes_client_list_with_trailing_dash() {
        assert_eq!(
            Frame::decode("0:2-4-5-"),
            Ok(Frame::ClientList(vec![2, 4, 5]))
        );
        assert_eq!(Frame::decode("0:"), Ok(Frame::ClientList(vec![])));
    }

    #[test]
    fn regular_round_trip_preserves_sender_and_text() {
        let frame = Frame::Regular {
            sender: 5,
            text: "hi".into(),
        };
        assert_eq!(Frame::decode(&frame.encode()), Ok(frame));
    }

    #[test]
    fn regular_text_may_contain_separator_characters() {
        let frame = Frame::Regular {
            sender: 7,
            text: "see you at 5:30 - maybe".into(),
        };
        assert_eq!(Frame::decode(&frame.encode()), Ok(frame));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(
            Frame::decode("no separator"),
            Err(FrameError::MissingSeparator(':'))
        );
        assert_eq!(
            Frame::decode("abc:hello"),
            Err(FrameError::InvalidKind("abc".into()))
        );
        assert_eq!(Frame::decode("9:hello"), Err(FrameError::UnknownKind(9)));
        assert_eq!(
            Frame::decode("1:xyz"),
            Err(FrameError::InvalidIdentity("xyz".into()))
        );
        assert_eq!(
            Frame::decode("2:hello"),
            Err(FrameError::MissingSeparator('-'))
        );
    }

    #[test]
    fn parses_routing_lines() {
        assert_eq!(parse_route("3:hello"), Ok((3, "hello")));
        assert_eq!(parse_route("3:a:b"), Ok((3, "a:b")));
        assert_eq!(
            parse_route("abc:hello"),
            Err(FrameError::InvalidIdentity("abc".into()))
        );
        assert_eq!(parse_route("hello"), Err(FrameError::MissingSeparator(':')));
    }

    #[tokio::test]
    async fn frame_round_trip_over_a_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let frame = Frame::Regular {
            sender: 5,
            text: "hi".into(),
        };

        write_frame(&mut writer, &frame).await.expect("write frame");
        let parsed = read_frame(&mut reader)
            .await
            .expect("read frame")
            .expect("expected a frame");

        assert_eq!(frame, parsed);
    }

    #[tokio::test]
    async fn clean_end_of_stream_reads_as_none() {
        let (writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        drop(writer);

        let result = read_line(&mut reader).await.expect("clean eof");
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn truncated_line_is_an_error_not_a_short_read() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"3:2").await.expect("write partial line");
        drop(writer);

        let err = read_line(&mut reader).await.expect_err("truncated line");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
