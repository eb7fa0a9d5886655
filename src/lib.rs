//! # slirc-net
//!
//! Connection lifecycle, framing and authentication for IRC clients.
//!
//! ## Features
//!
//! - One-at-a-time connect attempts over TCP, TLS and SOCKS5
//! - Registration with IRCv3 capability requests
//! - SASL PLAIN, SCRAM-SHA-1/256/512 and ECDSA-NIST256P-CHALLENGE
//! - Background listener with PING/PONG and liveness probing
//! - Reconnect backoff with a bounded retry budget
//! - ICB protocol translation and FTP control-reply assembly

#![deny(clippy::all)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use slirc_net::{Config, ConnectionManager, ConnectionRequest, Event};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::load("irc.toml")?);
//! let (manager, mut events) = ConnectionManager::new(config);
//!
//! let req = ConnectionRequest::new("irc.libera.chat", "6697", "ferris");
//! manager.connect_with_retry(&req).await?;
//! manager.send_line("JOIN #rust")?;
//!
//! while let Some(event) = events.recv().await {
//!     if let Event::Message(msg) = event {
//!         println!("{}", msg);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod framer;
pub mod ftp;
pub mod icb;
pub mod listener;
pub mod manager;
pub mod message;
pub mod reconnect;
pub mod registration;
pub mod resolver;
pub mod sasl;
pub mod socks;
pub mod tls;
pub mod transport;

pub use self::config::{CipherSuite, Config, SaslMechanismKind, SocksAddrType};
pub use self::error::{ConfigError, ConnError, NetError, SaslError};
pub use self::framer::{Crlf, Framer, Separator, MAX_LINE_LEN};
pub use self::ftp::{Assembled, FtpReply, ReplyAssembler};
pub use self::icb::{IcbDecoder, IcbPacket, IcbSession};
pub use self::listener::{ExitReason, Listener, ListenerExit};
pub use self::manager::{ConnectionManager, Established, Event, LastServer, Status};
pub use self::message::Message;
pub use self::reconnect::{Action, ReconnectPolicy};
pub use self::registration::ConnectionRequest;
pub use self::sasl::{SaslEngine, SaslState};
pub use self::transport::Transport;
