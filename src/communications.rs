use std::collections::VecDeque;
use std::str;

use bytes::Bytes;
use futures::future::FutureExt;
use gethostname::gethostname;
use log::warn;
use zeromq::prelude::*;
use zeromq::{ZmqError, ZmqMessage};

use crate::control::Event;
use crate::session::Session;

/// Telemetry publisher and command socket. Every event goes out as a four frame message
/// `[hostname, kind, point, value]`, the numbers as little-endian `f64`.
pub struct Comms {
    hostname: String,
    logs_sock: zeromq::PubSocket,
    logs_port: u16,
    command_sock: zeromq::RepSocket,
    command_port: u16,
}

#[must_use]
pub fn event_frames(hostname: &str, event: &Event) -> VecDeque<Bytes> {
    let (point, value) = event.pair();
    VecDeque::from([
        Bytes::copy_from_slice(hostname.as_bytes()),
        Bytes::from_static(event.kind().as_bytes()),
        Bytes::copy_from_slice(&point.to_le_bytes()),
        Bytes::copy_from_slice(&value.to_le_bytes()),
    ])
}

impl Comms {
    #[must_use]
    pub fn new() -> Option<Self> {
        Some(Comms {
            hostname: gethostname().into_string().ok()?,
            logs_sock: zeromq::PubSocket::new(),
            logs_port: 8080,
            command_sock: zeromq::RepSocket::new(),
            command_port: 8081,
        })
    }

    #[inline]
    #[must_use]
    pub fn logs_port(&self) -> u16 {
        self.logs_port
    }

    #[inline]
    #[must_use]
    pub fn command_port(&self) -> u16 {
        self.command_port
    }

    /// Answer one pending command, if there is one. Returns the command text.
    pub async fn handle_socket_request(&mut self, session: &mut Session) -> Option<String> {
        let cmd_msg = self.command_sock.recv().now_or_never()?.ok()?;
        let cmd = str::from_utf8(cmd_msg.get(0)?).ok()?.trim().to_string();
        let reply = if let Ok(s) = session.process_command(cmd.split(':')) {
            s
        } else {
            warn!("failed to process command [{cmd}]");
            format!("Command '{cmd}' not recognized")
        };
        if let Err(e) = self.command_sock.send(reply.into()).await {
            warn!("failed to reply to [{cmd}]: {e}");
        }
        Some(cmd)
    }

    /// # Errors
    /// Propagates any zeromq error in the socket send operation.
    pub async fn publish_event(&mut self, event: &Event) -> zeromq::ZmqResult<()> {
        let msg: ZmqMessage = event_frames(&self.hostname, event)
            .try_into()
            .map_err(|_| ZmqError::Other("empty telemetry message"))?;
        self.logs_sock.send(msg).await
    }

    /// # Errors
    /// In case of any zmq error, aborts early and returns the error.
    pub async fn bind_sockets(&mut self, logs_port: u16, command_port: u16) -> zeromq::ZmqResult<()> {
        self.logs_sock
            .bind(format!("tcp://0.0.0.0:{logs_port}").as_str())
            .await?;
        self.logs_port = logs_port;
        self.command_sock
            .bind(format!("tcp://0.0.0.0:{command_port}").as_str())
            .await?;
        self.command_port = command_port;
        Ok(())
    }
}
