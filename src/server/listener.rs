//! Virtual listeners: the server side record of a port a client asked us to
//! listen on. No socket is ever bound for them; connecting to one opens a
//! `forwarded-tcpip` channel back toward the owning client instead.

use async_trait::async_trait;
use russh::Channel;
use russh::server::{Handle, Msg};

/// The one thing the switchboard needs from a publisher's SSH connection:
/// opening `forwarded-tcpip` channels toward the client.
#[async_trait]
pub(crate) trait ConnectionHandle: Send + Sync {
    /// Opens a `forwarded-tcpip` channel. The listen host and port tell the
    /// client which of its `tcpip-forward` requests the channel belongs to;
    /// the originator pair is passed through from the initiating side.
    async fn open_forwarded_tcpip(
        &self,
        listen_host: String,
        listen_port: u32,
        originator_address: String,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error>;
}

#[async_trait]
impl ConnectionHandle for Handle {
    async fn open_forwarded_tcpip(
        &self,
        listen_host: String,
        listen_port: u32,
        originator_address: String,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_forwarded_tcpip(listen_host, listen_port, originator_address, originator_port)
            .await
    }
}

/// A virtual listening port opened by a client via `tcpip-forward`. The
/// listen host is remembered so the client can correlate incoming channels
/// with its request; it is not interpreted beyond that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VirtualListener {
    listen_host: String,
    listen_port: u16,
}

impl VirtualListener {
    pub fn new(listen_host: String, listen_port: u16) -> VirtualListener {
        VirtualListener { listen_host, listen_port }
    }

    pub fn listen_host(&self) -> &str {
        &self.listen_host
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }
}
