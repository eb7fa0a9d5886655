//! ICB (Internet Citizen's Band) mode.
//!
//! ICB packets are a length byte followed by a type byte and payload
//! fields separated by `\x01`. [`IcbDecoder`] reassembles packets across
//! reads, and [`IcbSession`] translates the packets the engine cares
//! about into IRC-form lines so the listener can dispatch them exactly
//! like server traffic (a successful login yields a synthetic `001`).

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::error::NetError;

/// Field separator inside a packet payload.
pub const FIELD_SEP: char = '\x01';

/// Largest payload (type byte included) a packet may carry.
pub const MESSAGE_MAX: usize = 253;

/// One decoded packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IcbPacket {
    /// Packet type, e.g. `b'a'` for login ok.
    pub kind: u8,
    /// Payload after the type byte, trailing NUL removed.
    pub payload: String,
}

impl IcbPacket {
    /// Payload split on [`FIELD_SEP`].
    pub fn fields(&self) -> std::str::Split<'_, char> {
        self.payload.split(FIELD_SEP)
    }
}

fn encode(kind: u8, payload: &str) -> Result<Vec<u8>, NetError> {
    let len = payload.len() + 1;
    if len > MESSAGE_MAX {
        return Err(NetError::MessageTooLong {
            actual: len,
            limit: MESSAGE_MAX,
        });
    }
    let mut packet = Vec::with_capacity(len + 1);
    packet.push(len as u8);
    packet.push(kind);
    packet.extend_from_slice(payload.as_bytes());
    Ok(packet)
}

/// Login packet: `a<login id>^A<nick>^A<group>^Alogin^A<password>^A^A`.
pub fn login_packet(username: &str, nickname: &str, password: &str) -> Result<Vec<u8>, NetError> {
    let payload = [username, nickname, "", "login", password, "", "", ""].join("\x01");
    encode(b'a', &payload)
}

/// Join `group`.
pub fn group_packet(group: &str) -> Result<Vec<u8>, NetError> {
    encode(b'h', &format!("g{}{}", FIELD_SEP, group))
}

/// Who listing for `arg` (a group name, or empty for everyone).
pub fn who_packet(arg: &str) -> Result<Vec<u8>, NetError> {
    encode(b'h', &format!("w{}{}", FIELD_SEP, arg))
}

/// Answer to a server ping.
pub fn pong_packet(arg: &str) -> Result<Vec<u8>, NetError> {
    encode(b'm', arg)
}

/// Keep-alive packet.
pub fn noop_packet() -> Vec<u8> {
    vec![1, b'n']
}

// ============================================================================
// Decoding
// ============================================================================

/// Length-prefixed packet decoder.
#[derive(Debug, Default)]
pub struct IcbDecoder {
    pending: BytesMut,
}

impl IcbDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every complete packet.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<IcbPacket> {
        self.pending.extend_from_slice(chunk);
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet() {
            packets.push(packet);
        }
        packets
    }

    fn next_packet(&mut self) -> Option<IcbPacket> {
        loop {
            let len = *self.pending.first()? as usize;
            if len == 0 {
                self.pending.advance(1);
                continue;
            }
            if self.pending.len() < len + 1 {
                return None;
            }
            self.pending.advance(1);
            let body = self.pending.split_to(len);
            let kind = body[0];
            let payload = body[1..].strip_suffix(b"\0").unwrap_or(&body[1..]);
            return Some(IcbPacket {
                kind,
                payload: String::from_utf8_lossy(payload).into_owned(),
            });
        }
    }
}

impl Decoder for IcbDecoder {
    type Item = IcbPacket;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<IcbPacket>, NetError> {
        if !src.is_empty() {
            self.pending.extend_from_slice(src);
            src.clear();
        }
        Ok(self.next_packet())
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Result of translating one packet.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Translation {
    /// IRC-form lines to dispatch as if the server sent them.
    pub lines: Vec<String>,
    /// Packets to send back to the server.
    pub replies: Vec<Vec<u8>>,
}

/// Per-connection ICB state.
#[derive(Debug, Default)]
pub struct IcbSession {
    nickname: String,
    protocol_level: String,
    host_id: String,
    server_id: String,
    group: Option<String>,
}

impl IcbSession {
    /// Session for a user logging in as `nickname`.
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_owned(),
            ..Self::default()
        }
    }

    /// Group currently joined.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Translate one packet.
    pub fn translate(&mut self, packet: &IcbPacket) -> Translation {
        let mut out = Translation::default();
        match packet.kind {
            b'a' => self.login_ok(&mut out),
            b'c' => self.personal_message(packet, &mut out),
            b'd' => self.status_message(packet, &mut out),
            b'e' => warn!("ICB error: {}", packet.payload),
            b'i' => self.command_output(packet, &mut out),
            b'j' => self.protocol(packet),
            b'l' => match pong_packet(&packet.payload) {
                Ok(pong) => out.replies.push(pong),
                Err(e) => warn!("ICB ping: {}", e),
            },
            kind => warn!(
                kind = %char::from(kind),
                len = packet.payload.len() + 1,
                "unknown ICB packet type: {}",
                packet.payload.replace(FIELD_SEP, "X")
            ),
        }
        out
    }

    fn has_ids(&self) -> bool {
        !self.protocol_level.is_empty() && !self.host_id.is_empty() && !self.server_id.is_empty()
    }

    fn login_ok(&self, out: &mut Translation) {
        if !self.has_ids() {
            warn!("ICB login ok without protocol level, host id or server id");
            return;
        }
        let (host, me, server) = (&self.host_id, &self.nickname, &self.server_id);
        out.lines.extend([
            format!(":{} 001 {} :Welcome to ICB, {}!", host, me, me),
            format!(
                ":{} 002 {} :Your host is {}, running version {}",
                host, me, server, self.protocol_level
            ),
            format!(":{} 375 {} :- {} Message Of The Day -", host, me, server),
            format!(":{} 372 {} :-----------------------------", host, me),
            format!(":{} 372 {} :   Internet Citizen's Band   ", host, me),
            format!(":{} 372 {} :-----------------------------", host, me),
            format!(":{} 376 {} :End of MOTD", host, me),
        ]);
    }

    fn personal_message(&self, packet: &IcbPacket, out: &mut Translation) {
        let mut fields = packet.fields();
        match (fields.next(), fields.next()) {
            (Some(from), Some(text)) if !from.is_empty() => {
                out.lines
                    .push(format!(":{} PRIVMSG {} :{}", from, self.nickname, text));
            }
            _ => warn!("ICB personal message with too few fields"),
        }
    }

    fn status_message(&mut self, packet: &IcbPacket, out: &mut Translation) {
        let (category, text) = packet
            .payload
            .split_once(FIELD_SEP)
            .unwrap_or((packet.payload.as_str(), ""));
        match category {
            "No-Pass" => info!("{}", text),
            "Status" => {
                let Some(group) = text.strip_prefix("You are now in group ") else {
                    info!("{}", text);
                    return;
                };
                if let Some(old) = self.group.take() {
                    out.lines.push(format!(":{} PART #{}", self.nickname, old));
                }
                out.lines.push(format!(":{} JOIN :#{}", self.nickname, group));
                match who_packet(group) {
                    Ok(who) => out.replies.push(who),
                    Err(e) => warn!("ICB who request: {}", e),
                }
                self.group = Some(group.to_owned());
            }
            _ => warn!(
                "unknown ICB status category: {}",
                packet.payload.replace(FIELD_SEP, "X")
            ),
        }
    }

    fn command_output(&self, packet: &IcbPacket, out: &mut Translation) {
        let payload = packet.payload.as_str();
        if let Some(text) = payload.strip_prefix("co") {
            let text: String = text.chars().filter(|&c| c != FIELD_SEP).collect();
            out.lines
                .push(format!(":{} NOTICE {} :{}", self.host_id, self.nickname, text));
        } else if let Some(rest) = payload.strip_prefix("wl") {
            let mut fields = rest.split(FIELD_SEP).filter(|f| !f.is_empty());
            let (Some(initial), Some(nick)) = (fields.next(), fields.next()) else {
                warn!("ICB who listing without initial token or nickname");
                return;
            };
            let moderator = if initial != " " { "@" } else { "" };
            out.lines.push(format!(
                ":{} 353 {} = #{} :{}{}",
                self.host_id,
                self.nickname,
                self.group.as_deref().unwrap_or(""),
                moderator,
                nick
            ));
        } else {
            warn!(
                "unknown ICB output type: {}",
                payload.replace(FIELD_SEP, "X")
            );
        }
    }

    fn protocol(&mut self, packet: &IcbPacket) {
        let mut fields = packet.fields().filter(|f| !f.is_empty());
        self.protocol_level = fields.next().unwrap_or_default().to_owned();
        self.host_id = fields.next().unwrap_or_default().to_owned();
        self.server_id = fields.next().unwrap_or_default().to_owned();

        if !self.has_ids() {
            self.protocol_level.clear();
            self.host_id.clear();
            self.server_id.clear();
        }
        debug!(
            level = %self.protocol_level,
            host = %self.host_id,
            server = %self.server_id,
            "ICB protocol packet"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(kind: u8, payload: &str) -> IcbPacket {
        IcbPacket {
            kind,
            payload: payload.to_owned(),
        }
    }

    fn logged_in() -> IcbSession {
        let mut session = IcbSession::new("alice");
        session.translate(&packet(b'j', "1\x01icb.example\x01ICB server 1.2"));
        session
    }

    #[test]
    fn test_login_packet_layout() {
        let pkt = login_packet("al", "alice", "pw").unwrap();
        let body = b"aal\x01alice\x01\x01login\x01pw\x01\x01\x01";
        assert_eq!(pkt[0] as usize, body.len());
        assert_eq!(&pkt[1..], body);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let err = login_packet("u", "n", &"x".repeat(300)).unwrap_err();
        assert!(matches!(err, NetError::MessageTooLong { limit: 253, .. }));
    }

    #[test]
    fn test_group_and_who_packets() {
        assert_eq!(group_packet("rust").unwrap(), b"\x07hg\x01rust".to_vec());
        assert_eq!(who_packet("").unwrap(), b"\x03hw\x01".to_vec());
    }

    #[test]
    fn test_decoder_handles_partial_reads() {
        let mut stream = Vec::new();
        stream.extend(encode(b'c', "bob\x01hi there").unwrap());
        stream.extend(encode(b'a', "").unwrap());

        let whole = IcbDecoder::new().feed(&stream);
        assert_eq!(whole.len(), 2);

        let mut decoder = IcbDecoder::new();
        let mut pieces = Vec::new();
        for byte in &stream {
            pieces.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(pieces, whole);
        assert_eq!(pieces[0], packet(b'c', "bob\x01hi there"));
    }

    #[test]
    fn test_decoder_strips_nul() {
        let packets = IcbDecoder::new().feed(b"\x04dab\0");
        assert_eq!(packets, vec![packet(b'd', "ab")]);
    }

    #[test]
    fn test_login_ok_emits_welcome() {
        let mut session = logged_in();
        let out = session.translate(&packet(b'a', ""));
        assert_eq!(out.lines[0], ":icb.example 001 alice :Welcome to ICB, alice!");
        assert_eq!(
            out.lines[1],
            ":icb.example 002 alice :Your host is ICB server 1.2, running version 1"
        );
        assert_eq!(out.lines.last().unwrap(), ":icb.example 376 alice :End of MOTD");
        assert_eq!(out.lines.len(), 7);
    }

    #[test]
    fn test_login_ok_without_ids_is_silent() {
        let mut session = IcbSession::new("alice");
        session.translate(&packet(b'j', "1\x01\x01"));
        assert!(session.translate(&packet(b'a', "")).lines.is_empty());
    }

    #[test]
    fn test_personal_message() {
        let mut session = logged_in();
        let out = session.translate(&packet(b'c', "bob\x01hello"));
        assert_eq!(out.lines, vec![":bob PRIVMSG alice :hello"]);
    }

    #[test]
    fn test_group_change_parts_and_joins() {
        let mut session = logged_in();
        let out = session.translate(&packet(b'd', "Status\x01You are now in group one"));
        assert_eq!(out.lines, vec![":alice JOIN :#one"]);
        assert_eq!(out.replies, vec![who_packet("one").unwrap()]);

        let out = session.translate(&packet(b'd', "Status\x01You are now in group two"));
        assert_eq!(out.lines, vec![":alice PART #one", ":alice JOIN :#two"]);
        assert_eq!(session.group(), Some("two"));
    }

    #[test]
    fn test_who_listing() {
        let mut session = logged_in();
        session.translate(&packet(b'd', "Status\x01You are now in group one"));

        let out = session.translate(&packet(b'i', "wl\x01m\x01bob\x0110\x010\x01123\x01bob\x01host\x01(nr)"));
        assert_eq!(out.lines, vec![":icb.example 353 alice = #one :@bob"]);

        let out = session.translate(&packet(b'i', "wl\x01 \x01carol\x010"));
        assert_eq!(out.lines, vec![":icb.example 353 alice = #one :carol"]);
    }

    #[test]
    fn test_generic_output() {
        let mut session = logged_in();
        let out = session.translate(&packet(b'i', "co\x01Group: one"));
        assert_eq!(out.lines, vec![":icb.example NOTICE alice :Group: one"]);
    }

    #[test]
    fn test_ping_gets_pong() {
        let mut session = logged_in();
        let out = session.translate(&packet(b'l', "abc"));
        assert_eq!(out.replies, vec![b"\x04mabc".to_vec()]);
    }

    #[test]
    fn test_unknown_type_ignored() {
        let mut session = logged_in();
        assert_eq!(session.translate(&packet(b'z', "?")), Translation::default());
    }
}
