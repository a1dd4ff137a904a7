use std::{fmt, io};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// Longest line accepted from a peer unless configured otherwise.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

/// A `recipient:body` line sent by a logged-in client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub recipient: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("directive is missing the ':' separator")]
    MissingSeparator,
}

impl Directive {
    /// Splits on the first `:` only, so bodies may contain further colons.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (recipient, body) = line.split_once(':').ok_or(ParseError::MissingSeparator)?;
        Ok(Self {
            recipient: recipient.trim().to_string(),
            body: body.to_string(),
        })
    }
}

/// Server-generated text that is not attributed to another user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    InvalidFormat,
    UserNotFound { recipient: String },
    FailedToSend { recipient: String },
    EmptyName,
    NameTaken { name: String },
    MessageTooLong,
    ShuttingDown,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::InvalidFormat => f.write_str("[System] Invalid format."),
            Notice::UserNotFound { recipient } => {
                write!(f, "[System] User '{recipient}' not found.")
            }
            Notice::FailedToSend { recipient } => write!(f, "[System] Failed to send to {recipient}."),
            Notice::EmptyName => f.write_str("[System] Name cannot be empty."),
            Notice::NameTaken { name } => write!(f, "[System] Name '{name}' is already in use."),
            Notice::MessageTooLong => f.write_str("[System] Message too long."),
            Notice::ShuttingDown => f.write_str("[System] Server shutting down."),
        }
    }
}

/// Every line shape the relay writes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Welcome { name: String },
    Relayed { sender: String, body: String },
    Notice(Notice),
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLine::Welcome { name } => {
                write!(f, "Welcome {name}. Format: 'Recipient: Message'")
            }
            ServerLine::Relayed { sender, body } => write!(f, "@{sender}: {body}"),
            ServerLine::Notice(notice) => fmt::Display::fmt(notice, f),
        }
    }
}

impl From<Notice> for ServerLine {
    fn from(notice: Notice) -> Self {
        ServerLine::Notice(notice)
    }
}

/// One decoded unit of client input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Line(String),
    /// A line exceeded the configured limit and was discarded up to its newline.
    TooLong,
}

/// Newline-delimited reader that survives oversized lines.
///
/// `FramedRead` ends the stream after the first decode error, so the codec is
/// driven by hand here to keep the session alive once an oversized line has
/// been skipped.
pub struct LineReader<R> {
    inner: R,
    codec: LinesCodec,
    buffer: BytesMut,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_line_length: usize) -> Self {
        Self {
            inner,
            codec: LinesCodec::new_with_max_length(max_line_length),
            buffer: BytesMut::with_capacity(max_line_length.min(8 * 1024)),
        }
    }

    /// Returns `Ok(None)` once the peer has closed its side of the stream.
    ///
    /// Invalid UTF-8 surfaces as an `InvalidData` error.
    pub async fn next_line(&mut self) -> io::Result<Option<Inbound>> {
        loop {
            if let Some(inbound) = decoded(self.codec.decode(&mut self.buffer))? {
                return Ok(Some(inbound));
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                return decoded(self.codec.decode_eof(&mut self.buffer));
            }
        }
    }
}

fn decoded(result: Result<Option<String>, LinesCodecError>) -> io::Result<Option<Inbound>> {
    match result {
        Ok(line) => Ok(line.map(Inbound::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Inbound::TooLong)),
        Err(LinesCodecError::Io(err)) => Err(err),
    }
}

pub async fn write_line<W, T>(writer: &mut W, line: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: fmt::Display + ?Sized,
{
    // One write per line, flushed, so a peer sees each message as soon as it is relayed.
    let mut encoded = line.to_string().into_bytes();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_splits_on_first_colon() {
        let directive = Directive::parse("bob:see you at 10:30").expect("valid directive");
        assert_eq!(directive.recipient, "bob");
        assert_eq!(directive.body, "see you at 10:30");
    }

    #[test]
    fn directive_body_is_kept_verbatim() {
        let directive = Directive::parse(" bob :    indented code ").expect("valid directive");
        assert_eq!(directive.recipient, "bob");
        assert_eq!(directive.body, "    indented code ");
    }

    #[test]
    fn directive_trims_recipient_and_allows_empty_body() {
        let directive = Directive::parse("  carol :").expect("valid directive");
        assert_eq!(
            directive,
            Directive {
                recipient: "carol".into(),
                body: String::new(),
            }
        );
    }

    #[test]
    fn directive_without_separator_is_rejected() {
        assert_eq!(
            Directive::parse("hello everyone"),
            Err(ParseError::MissingSeparator)
        );
    }

    #[test]
    fn server_lines_render_wire_text() {
        let welcome = ServerLine::Welcome {
            name: "alice".into(),
        };
        assert_eq!(
            welcome.to_string(),
            "Welcome alice. Format: 'Recipient: Message'"
        );

        let relayed = ServerLine::Relayed {
            sender: "alice".into(),
            body: "hi there".into(),
        };
        assert_eq!(relayed.to_string(), "@alice: hi there");

        let missing = ServerLine::from(Notice::UserNotFound {
            recipient: "ghost".into(),
        });
        assert_eq!(missing.to_string(), "[System] User 'ghost' not found.");
    }

    #[tokio::test]
    async fn write_then_read_single_line() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = LineReader::new(reader, DEFAULT_MAX_LINE_LENGTH);

        write_line(&mut writer, &Notice::InvalidFormat)
            .await
            .expect("write line");
        let line = reader
            .next_line()
            .await
            .expect("read line")
            .expect("expected a line");

        assert_eq!(line, Inbound::Line("[System] Invalid format.".into()));
    }

    #[tokio::test]
    async fn reader_strips_crlf_and_reports_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = LineReader::new(reader, DEFAULT_MAX_LINE_LENGTH);

        writer.write_all(b"alice\r\nbob:hi\n").await.expect("write");
        drop(writer);

        assert_eq!(
            reader.next_line().await.expect("first"),
            Some(Inbound::Line("alice".into()))
        );
        assert_eq!(
            reader.next_line().await.expect("second"),
            Some(Inbound::Line("bob:hi".into()))
        );
        assert_eq!(reader.next_line().await.expect("eof"), None);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_and_reading_resumes() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = LineReader::new(reader, 8);

        writer
            .write_all(b"bob:this line is far too long\nbob:ok\n")
            .await
            .expect("write");
        drop(writer);

        assert_eq!(
            reader.next_line().await.expect("oversized"),
            Some(Inbound::TooLong)
        );
        assert_eq!(
            reader.next_line().await.expect("next"),
            Some(Inbound::Line("bob:ok".into()))
        );
        assert_eq!(reader.next_line().await.expect("eof"), None);
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_error() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = LineReader::new(reader, DEFAULT_MAX_LINE_LENGTH);

        writer.write_all(&[0xff, 0xfe, b'\n']).await.expect("write");

        let err = reader.next_line().await.expect_err("decode should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
