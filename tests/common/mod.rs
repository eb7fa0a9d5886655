//! Shared helpers for the integration tests: a scripted IRC peer and
//! event-stream helpers.

#![allow(dead_code)]

use std::time::Duration;

use slirc_net::{Config, Event, Message, Status};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

pub const STEP: Duration = Duration::from_secs(5);

/// Config with short timeouts and every optional feature off.
pub fn config() -> Config {
    Config {
        connection_timeout: 5,
        reconnect_delay: 1,
        reconnect_backoff_delay: 1,
        reconnect_delay_max: 5,
        reconnect_retries: 3,
        auto_reconnect: false,
        ..Config::default()
    }
}

/// Bind a local listener; returns it with its port as a string.
pub async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    (listener, port)
}

/// A port nothing listens on.
pub async fn closed_port() -> String {
    let (listener, port) = listen().await;
    drop(listener);
    port
}

/// Server side of one scripted connection.
pub struct Peer<S> {
    io: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Peer<S> {
    pub fn new(stream: S) -> Self {
        Self {
            io: BufReader::new(stream),
        }
    }

    /// Next line without its terminator; `None` at end of stream.
    pub async fn try_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(STEP, self.io.read_line(&mut line))
            .await
            .expect("peer read timed out")
            .unwrap_or(0);
        if n == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_owned())
    }

    /// Next line; panics at end of stream.
    pub async fn line(&mut self) -> String {
        self.try_line().await.expect("client closed the connection")
    }

    /// Send one line with CRLF appended.
    pub async fn send(&mut self, line: &str) {
        let stream = self.io.get_mut();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Read every line up to and including `USER`.
    pub async fn registration(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let done = line.starts_with("USER ");
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Accept registration and send the welcome numeric.
    pub async fn welcome(&mut self, nick: &str) -> Vec<String> {
        let lines = self.registration().await;
        self.send(&format!(":irc.test 001 {} :Welcome to the test network", nick))
            .await;
        lines
    }

    /// Drain until the client closes; returns what it sent.
    pub async fn until_closed(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.try_line().await {
            lines.push(line);
        }
        lines
    }

    pub fn into_inner(self) -> S {
        self.io.into_inner()
    }
}

/// Next status event, skipping messages.
pub async fn next_status(events: &mut UnboundedReceiver<Event>) -> Status {
    loop {
        let event = tokio::time::timeout(STEP, events.recv())
            .await
            .expect("no status event")
            .expect("event channel closed");
        if let Event::Status(status) = event {
            return status;
        }
    }
}

/// Next status event within `wait`, if any.
pub async fn status_within(events: &mut UnboundedReceiver<Event>, wait: Duration) -> Option<Status> {
    tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Some(Event::Status(status)) => return Some(status),
                Some(Event::Message(_)) => continue,
                None => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Next message event with `command`.
pub async fn next_message(events: &mut UnboundedReceiver<Event>, command: &str) -> Message {
    loop {
        let event = tokio::time::timeout(STEP, events.recv())
            .await
            .expect("no message event")
            .expect("event channel closed");
        if let Event::Message(msg) = event {
            if msg.command == command {
                return msg;
            }
        }
    }
}
