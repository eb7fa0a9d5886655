//! FTP control-channel reply assembly (RFC 959 section 4.2).
//!
//! Replies are `NNN text` on one line, or a multi-line block opened by
//! `NNN-text` and closed by the first line that starts with `NNN `.
//! The control channel has its own [`Framer`], independent of the IRC
//! stream's.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::warn;

use crate::error::NetError;
use crate::framer::{Crlf, Framer};

/// One complete reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FtpReply {
    /// Three-digit reply code.
    pub code: u16,
    /// Text lines with the code prefixes removed.
    pub lines: Vec<String>,
}

impl FtpReply {
    /// 1xx.
    pub fn is_preliminary(&self) -> bool {
        self.code / 100 == 1
    }

    /// 2xx.
    pub fn is_completion(&self) -> bool {
        self.code / 100 == 2
    }

    /// 4xx or 5xx.
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// All lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Split `NNN<sep>text`, where `sep` is ` `, `-` or end of line.
fn split_code(line: &str) -> Option<(u16, Option<char>, &str)> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) || !(b'1'..=b'5').contains(&digits.as_bytes()[0]) {
        return None;
    }
    let code = digits.parse().ok()?;
    let rest = &line[3..];
    match rest.chars().next() {
        None => Some((code, None, "")),
        Some(sep @ (' ' | '-')) => Some((code, Some(sep), &rest[1..])),
        Some(_) => None,
    }
}

/// What one [`ReplyAssembler::feed`] call produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assembled {
    /// Replies completed by this chunk, in order.
    pub replies: Vec<FtpReply>,
    /// Lines that could not open a reply.
    pub malformed: Vec<String>,
}

impl Assembled {
    /// Append another chunk's output.
    pub fn extend(&mut self, other: Assembled) {
        self.replies.extend(other.replies);
        self.malformed.extend(other.malformed);
    }
}

/// Folds framed lines into [`FtpReply`] values.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    framer: Framer<Crlf>,
    open: Option<FtpReply>,
}

impl ReplyAssembler {
    /// Create an assembler with an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-line reply is waiting for its last line.
    pub fn in_multiline(&self) -> bool {
        self.open.is_some()
    }

    /// Feed raw bytes from the control connection.
    ///
    /// Every complete line in `chunk` is processed. Lines that cannot open
    /// a reply are reported in [`Assembled::malformed`] next to the
    /// replies completed by the same chunk.
    ///
    /// # Errors
    ///
    /// Framing errors only, e.g. an over-long line.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Assembled, NetError> {
        let mut out = Assembled::default();
        for line in self.framer.feed(chunk)? {
            let line = String::from_utf8_lossy(&line);
            match self.push_line(&line) {
                Ok(Some(reply)) => out.replies.push(reply),
                Ok(None) => {}
                Err(_) => {
                    warn!(line = %line, "malformed FTP reply line");
                    out.malformed.push(line.into_owned());
                }
            }
        }
        Ok(out)
    }

    /// Feed one already framed line.
    ///
    /// # Errors
    ///
    /// [`NetError::MalformedReply`] when a reply does not open with a
    /// valid code. The assembler stays usable.
    pub fn push_line(&mut self, line: &str) -> Result<Option<FtpReply>, NetError> {
        if let Some(open) = self.open.as_mut() {
            match split_code(line) {
                Some((code, Some(' ') | None, text)) if code == open.code => {
                    open.lines.push(text.to_owned());
                    return Ok(self.open.take());
                }
                Some((code, Some('-'), text)) if code == open.code => {
                    open.lines.push(text.to_owned());
                }
                _ => open.lines.push(line.to_owned()),
            }
            return Ok(None);
        }

        let (code, sep, text) =
            split_code(line).ok_or_else(|| NetError::MalformedReply(line.to_owned()))?;
        let reply = FtpReply {
            code,
            lines: vec![text.to_owned()],
        };
        if sep == Some('-') {
            self.open = Some(reply);
            return Ok(None);
        }
        Ok(Some(reply))
    }
}

/// Wrap a control connection in a line reader.
pub fn control_reader<R: AsyncRead>(reader: R) -> FramedRead<R, Framer<Crlf>> {
    FramedRead::new(reader, Framer::new())
}

/// Read the next complete reply from `lines`.
///
/// # Errors
///
/// [`NetError::ConnectionClosed`] if the stream ends mid-reply, or any
/// framing or parse error.
pub async fn read_reply<R>(lines: &mut FramedRead<R, Framer<Crlf>>) -> Result<FtpReply, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut assembler = ReplyAssembler::new();
    while let Some(line) = lines.next().await {
        let line = line?;
        if let Some(reply) = assembler.push_line(&String::from_utf8_lossy(&line))? {
            return Ok(reply);
        }
    }
    Err(NetError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTILINE: &[u8] =
        b"220-Welcome to ftp.example\r\n220-Be nice\r\n 220 not the end\r\n220 Ready\r\n";

    #[test]
    fn test_single_line() {
        let mut asm = ReplyAssembler::new();
        let replies = asm.feed(b"200 Command okay\r\n").unwrap().replies;
        assert_eq!(
            replies,
            vec![FtpReply {
                code: 200,
                lines: vec!["Command okay".to_owned()]
            }]
        );
        assert!(replies[0].is_completion());
    }

    #[test]
    fn test_multiline() {
        let mut asm = ReplyAssembler::new();
        let replies = asm.feed(MULTILINE).unwrap().replies;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code, 220);
        assert_eq!(
            replies[0].lines,
            vec!["Welcome to ftp.example", "Be nice", " 220 not the end", "Ready"]
        );
        assert!(!asm.in_multiline());
    }

    #[test]
    fn test_multiline_split_anywhere() {
        let whole = ReplyAssembler::new().feed(MULTILINE).unwrap();
        for cut in 1..MULTILINE.len() {
            let mut asm = ReplyAssembler::new();
            let mut out = asm.feed(&MULTILINE[..cut]).unwrap();
            out.extend(asm.feed(&MULTILINE[cut..]).unwrap());
            assert_eq!(out, whole, "cut at {}", cut);
        }
    }

    #[test]
    fn test_malformed_line_keeps_rest_of_chunk() {
        let mut asm = ReplyAssembler::new();
        let out = asm.feed(b"garbage\r\n200 OK\r\n").unwrap();
        assert_eq!(out.malformed, vec!["garbage"]);
        assert_eq!(
            out.replies,
            vec![FtpReply {
                code: 200,
                lines: vec!["OK".to_owned()]
            }]
        );
    }

    #[test]
    fn test_bare_code() {
        let mut asm = ReplyAssembler::new();
        let reply = asm.push_line("421").unwrap().unwrap();
        assert_eq!(reply.code, 421);
        assert!(reply.is_error());
    }

    #[test]
    fn test_malformed_code_is_recoverable() {
        let mut asm = ReplyAssembler::new();
        assert!(matches!(
            asm.push_line("hello"),
            Err(NetError::MalformedReply(_))
        ));
        assert!(matches!(
            asm.push_line("999 nope"),
            Err(NetError::MalformedReply(_))
        ));
        assert!(asm.push_line("150 Opening").unwrap().unwrap().is_preliminary());
    }

    #[tokio::test]
    async fn test_read_reply_from_stream() {
        let data: &[u8] = b"230-Hi\r\n230 Logged in\r\n226 Done\r\n";
        let mut lines = control_reader(data);
        let first = read_reply(&mut lines).await.unwrap();
        assert_eq!(first.code, 230);
        assert_eq!(first.text(), "Hi\nLogged in");
        let second = read_reply(&mut lines).await.unwrap();
        assert_eq!(second.code, 226);
        assert!(matches!(
            read_reply(&mut lines).await,
            Err(NetError::ConnectionClosed)
        ));
    }
}
