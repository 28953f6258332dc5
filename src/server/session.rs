//! Per-connection session handling. Each SSH connection gets one
//! [`ClientHandler`], which owns the connection's identity and virtual
//! listeners and drives the registry on its behalf.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use russh::keys::ssh_key;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use slog::o;
use thiserror::Error;

use crate::auth::authorized_keys::AuthorizedKeys;
use crate::auth::{ClientIdentity, Permissions};
use crate::server::commands;
use crate::server::listener::{ConnectionHandle, VirtualListener};
use crate::server::names;
use crate::server::registry::Registry;
use crate::server::splice;

/// The registry-visible side of a connection: its names, where it connected
/// from, the handle for opening channels back to it, and the virtual
/// listeners it owns.
pub(crate) struct Publisher {
    /// Primary name.
    pub hostname: String,
    /// Additional names, in authorized keys order.
    pub aliases: Vec<String>,
    /// All names, primary first. Fixed for the connection's lifetime.
    pub names: Vec<String>,
    /// Peer address of the connection.
    pub peer: Option<SocketAddr>,
    conn: Box<dyn ConnectionHandle>,
    /// Owned virtual listeners, keyed by port. Locked before the registry
    /// whenever both are held.
    listeners: Mutex<HashMap<u16, VirtualListener>>,
    logger: slog::Logger,
}

impl PartialEq for Publisher {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Publisher {
    fn new(identity: ClientIdentity, peer: Option<SocketAddr>, conn: Box<dyn ConnectionHandle>, logger: slog::Logger) -> Arc<Publisher> {
        Arc::new(Publisher {
            hostname: identity.hostname,
            aliases: identity.aliases,
            names: identity.names,
            peer,
            conn,
            listeners: Mutex::new(HashMap::new()),
            logger,
        })
    }

    /// Stores a new listener, registering this connection's names on the
    /// first one. A port that is already taken refuses the newcomer and
    /// leaves the existing listener in place.
    pub fn create_listener(self: &Arc<Self>, registry: &Registry, listener: VirtualListener) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.is_empty() {
            registry.register(self);
        }
        match listeners.entry(listener.listen_port()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(listener);
                true
            }
        }
    }

    /// Closes the listener on `port`, unregistering this connection's names
    /// when it was the last one. Ports that are already gone are a no-op.
    pub fn remove_listener(self: &Arc<Self>, registry: &Registry, port: u16) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.remove(&port).is_none() {
            return false;
        }
        if listeners.is_empty() {
            registry.unregister(self);
        }
        slog::info!(self.logger, "Removed virtual listener for {:?}, port {}", self.names, port);
        true
    }

    /// Closes every listener at connection teardown. Safe to call more than
    /// once.
    pub fn close_all_listeners(self: &Arc<Self>, registry: &Registry) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.is_empty() {
            return;
        }
        for (port, _) in listeners.drain() {
            slog::info!(self.logger, "Removed virtual listener for {:?}, port {}", self.names, port);
        }
        registry.unregister(self);
    }

    /// Snapshot of the listener on `port`, if any.
    pub fn listener(&self, port: u16) -> Option<VirtualListener> {
        self.listeners.lock().unwrap().get(&port).cloned()
    }

    /// The advertised ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().unwrap().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Opens a `forwarded-tcpip` channel toward the publishing client for a
    /// connection arriving on `listener`.
    pub async fn open_forwarded_channel(
        &self,
        listener: &VirtualListener,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.conn
            .open_forwarded_tcpip(
                listener.listen_host().to_string(),
                u32::from(listener.listen_port()),
                originator_address.to_string(),
                originator_port,
            )
            .await
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("hostname", &self.hostname)
            .field("names", &self.names)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Serves a single SSH connection: authenticates it against the authorized
/// keys file and handles its forward, channel and session requests.
pub(crate) struct ClientHandler {
    registry: Arc<Registry>,
    authorized_keys_path: PathBuf,
    peer: Option<SocketAddr>,
    logger: slog::Logger,
    identity: Option<ClientIdentity>,
    publisher: Option<Arc<Publisher>>,
}

impl ClientHandler {
    pub fn new(registry: Arc<Registry>, authorized_keys_path: PathBuf, peer: Option<SocketAddr>, logger: slog::Logger) -> ClientHandler {
        ClientHandler {
            registry,
            authorized_keys_path,
            peer,
            logger,
            identity: None,
            publisher: None,
        }
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.peer.map(|addr| addr.ip())
    }

    fn permissions(&self) -> Permissions {
        self.identity.as_ref().map(|identity| identity.permissions).unwrap_or_default()
    }

    /// The shared publisher record for this connection, created on first use
    /// once the session handle is available.
    fn publisher(&mut self, session: &mut Session) -> Option<Arc<Publisher>> {
        if self.publisher.is_none() {
            let identity = self.identity.clone()?;
            self.publisher = Some(Publisher::new(identity, self.peer, Box::new(session.handle()), self.logger.clone()));
        }
        self.publisher.clone()
    }

    /// Re-reads the authorized keys file. There is no point continuing
    /// authentication without it, so a read failure yields `None` and the
    /// caller rejects the attempt.
    async fn load_keys(&self) -> Option<AuthorizedKeys> {
        match AuthorizedKeys::load(&self.authorized_keys_path, &self.logger).await {
            Ok(keys) => Some(keys),
            Err(err) => {
                slog::error!(self.logger, "Failed to read key file {}: {}", self.authorized_keys_path.display(), err);
                None
            }
        }
    }

    async fn run_command(&mut self, command: Option<&str>, channel: ChannelId, session: &mut Session) -> Result<(), russh::Error> {
        session.channel_success(channel)?;
        let context = commands::CommandContext {
            permissions: self.permissions(),
            registry: Arc::clone(&self.registry),
            logger: self.logger.clone(),
        };
        let output = commands::dispatch(command).handle(&context).await;
        if !output.stdout.is_empty() {
            session.data(channel, CryptoVec::from_slice(output.stdout.as_bytes()))?;
        }
        if !output.stderr.is_empty() {
            session.extended_data(channel, 1, CryptoVec::from_slice(output.stderr.as_bytes()))?;
        }
        session.exit_status_request(channel, output.exit_status)?;
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

/// Why a `tcpip-forward` request was turned down.
#[derive(Debug, Error, PartialEq, Eq)]
enum ListenDenied {
    #[error("No LISTEN permission, denying request")]
    MissingPermission,
    #[error("Dynamic listen port not supported, denying request")]
    DynamicPort,
    #[error("Listen port {0} out of range, denying request")]
    PortOutOfRange(u32),
}

/// Vets a listen request, returning the port to advertise.
fn check_listen_request(permissions: Permissions, port: u32) -> Result<u16, ListenDenied> {
    if !permissions.contains(Permissions::LISTEN) {
        return Err(ListenDenied::MissingPermission);
    }
    if port == 0 {
        return Err(ListenDenied::DynamicPort);
    }
    u16::try_from(port).map_err(|_| ListenDenied::PortOutOfRange(port))
}

/// Whether the connection may open channels to published ports.
fn may_initiate(permissions: Permissions) -> bool {
    permissions.contains(Permissions::INITIATE)
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn auth_publickey_offered(&mut self, user: &str, key: &ssh_key::PublicKey) -> Result<Auth, Self::Error> {
        let Some(keys) = self.load_keys().await else {
            return Ok(reject());
        };
        if keys.find(key, self.peer_ip()).is_some() {
            Ok(Auth::Accept)
        } else {
            slog::debug!(self.logger, "Rejecting key {} offered by {}", key.fingerprint(Default::default()), user);
            Ok(reject())
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &ssh_key::PublicKey) -> Result<Auth, Self::Error> {
        let Some(keys) = self.load_keys().await else {
            return Ok(reject());
        };
        let Some(entry) = keys.find(key, self.peer_ip()) else {
            slog::debug!(self.logger, "Rejecting key {} offered by {}", key.fingerprint(Default::default()), user);
            return Ok(reject());
        };
        let identity = ClientIdentity::from_key_options(user, &entry.options, &self.logger);
        self.logger = self.logger.new(o!("hostname" => identity.hostname.clone()));
        slog::info!(self.logger, "Authenticated {} with key {}", user, entry.key.fingerprint(Default::default()));
        self.identity = Some(identity);
        Ok(Auth::Accept)
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
        let listen_port = match check_listen_request(self.permissions(), *port) {
            Ok(listen_port) => listen_port,
            Err(denied) => {
                slog::error!(self.logger, "{}", denied);
                return Ok(false);
            }
        };
        let Some(publisher) = self.publisher(session) else {
            return Ok(false);
        };

        slog::info!(self.logger, "Creating virtual listener for {:?}, port {}", publisher.names, listen_port);
        let listener = VirtualListener::new(address.to_string(), listen_port);
        if !publisher.create_listener(&self.registry, listener) {
            slog::error!(self.logger, "Duplicate listen port {} requested, refusing the second one", listen_port);
            return Ok(false);
        }
        Ok(true)
    }

    async fn cancel_tcpip_forward(&mut self, _address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        let (Some(publisher), Ok(port)) = (self.publisher.clone(), u16::try_from(port)) else {
            return Ok(false);
        };
        Ok(publisher.remove_listener(&self.registry, port))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !may_initiate(self.permissions()) {
            slog::error!(self.logger, "No INITIATE permission, denying request");
            return Ok(false);
        }

        // Index 0, the most recent publisher, when the designator leaves it out.
        let (name, index) = names::split_name_index(host_to_connect, 0);
        let publisher = match self.registry.lookup(name, index) {
            Ok(publisher) => publisher,
            Err(err) => {
                slog::error!(self.logger, "{}", err);
                return Ok(false);
            }
        };
        let listener = u16::try_from(port_to_connect).ok().and_then(|port| publisher.listener(port));
        let Some(listener) = listener else {
            slog::error!(self.logger, "Port {} on slave {} not found", port_to_connect, publisher.hostname);
            return Ok(false);
        };

        // The publisher and listener snapshots are taken; from here on the
        // registry is no longer consulted.
        let outbound = match publisher.open_forwarded_channel(&listener, originator_address, originator_port).await {
            Ok(outbound) => outbound,
            Err(err) => {
                slog::error!(self.logger, "Opening forwarded channel to {} failed: {}", publisher.hostname, err);
                return Ok(false);
            }
        };

        let logger = self.logger.new(o!(
            "target" => names::join_name_index(name, index),
            "port" => listener.listen_port(),
        ));
        slog::debug!(logger, "Circuit established to {}", publisher.hostname);
        tokio::spawn(splice::splice(channel, outbound, logger));
        Ok(true)
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        self.run_command(Some(command.as_ref()), channel, session).await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.run_command(None, channel, session).await
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // All listeners normally close themselves before this point; losing
        // the connection mid-flight must clean up the same way.
        if let Some(publisher) = self.publisher.take() {
            publisher.close_all_listeners(&self.registry);
        }
        slog::info!(self.logger, "Connection closed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::auth::authorized_keys::KeyOptions;

    struct NullConn;

    #[async_trait::async_trait]
    impl ConnectionHandle for NullConn {
        async fn open_forwarded_tcpip(&self, _: String, _: u32, _: String, _: u32) -> Result<Channel<Msg>, russh::Error> {
            Err(russh::Error::Disconnect)
        }
    }

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    /// A registry-ready publisher with no listeners yet.
    pub(crate) fn publisher(hostname: &str, aliases: &[&str]) -> Arc<Publisher> {
        let options = KeyOptions {
            access: vec!["listen".to_string()],
            hostname: vec![hostname.to_string()],
            alias: aliases.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let identity = ClientIdentity::from_key_options("user", &options, &discard());
        Publisher::new(identity, Some("192.0.2.10:49152".parse().unwrap()), Box::new(NullConn), discard())
    }

    fn listener(port: u16) -> VirtualListener {
        VirtualListener::new("localhost".to_string(), port)
    }

    #[test]
    fn listen_requests_are_vetted() {
        assert_eq!(check_listen_request(Permissions::LISTEN, 80), Ok(80));
        assert_eq!(check_listen_request(Permissions::LISTEN, 65535), Ok(65535));
        assert_eq!(
            check_listen_request(Permissions::INITIATE | Permissions::LIST_LISTENERS, 80),
            Err(ListenDenied::MissingPermission)
        );
        assert_eq!(check_listen_request(Permissions::empty(), 80), Err(ListenDenied::MissingPermission));
        assert_eq!(check_listen_request(Permissions::LISTEN, 0), Err(ListenDenied::DynamicPort));
        assert_eq!(check_listen_request(Permissions::all(), 0), Err(ListenDenied::DynamicPort));
        assert_eq!(check_listen_request(Permissions::LISTEN, 70000), Err(ListenDenied::PortOutOfRange(70000)));
    }

    #[test]
    fn initiating_requires_the_permission() {
        assert!(may_initiate(Permissions::INITIATE | Permissions::LIST_LISTENERS));
        assert!(may_initiate(Permissions::all()));
        assert!(!may_initiate(Permissions::LISTEN));
        assert!(!may_initiate(Permissions::LIST_LISTENERS));
        assert!(!may_initiate(Permissions::empty()));
    }

    #[test]
    fn first_listener_registers_the_names() {
        let registry = Registry::new();
        let alice = publisher("alice", &["web"]);

        assert!(registry.lookup("alice", 0).is_err());
        assert!(alice.create_listener(&registry, listener(22)));
        assert!(registry.lookup("alice", 0).is_ok());
        assert!(registry.lookup("web", 0).is_ok());
    }

    #[test]
    fn removing_the_last_listener_unregisters() {
        let registry = Registry::new();
        let alice = publisher("alice", &[]);
        alice.create_listener(&registry, listener(80));
        alice.create_listener(&registry, listener(443));

        assert!(alice.remove_listener(&registry, 80));
        assert!(registry.lookup("alice", 0).is_ok());
        assert!(alice.remove_listener(&registry, 443));
        assert!(registry.lookup("alice", 0).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let alice = publisher("alice", &[]);
        alice.create_listener(&registry, listener(80));

        assert!(alice.remove_listener(&registry, 80));
        assert!(!alice.remove_listener(&registry, 80));
        assert!(!alice.remove_listener(&registry, 8080));
    }

    #[test]
    fn duplicate_port_keeps_the_first_listener() {
        let registry = Registry::new();
        let alice = publisher("alice", &[]);
        let first = VirtualListener::new("localhost".to_string(), 80);
        let second = VirtualListener::new("elsewhere".to_string(), 80);

        assert!(alice.create_listener(&registry, first.clone()));
        assert!(!alice.create_listener(&registry, second));
        assert_eq!(alice.listener(80), Some(first));
        // The refusal left the registration alone.
        assert!(registry.lookup("alice", 0).is_ok());
    }

    #[test]
    fn teardown_clears_all_listeners_and_registrations() {
        let registry = Registry::new();
        let alice = publisher("alice", &["web"]);
        alice.create_listener(&registry, listener(80));
        alice.create_listener(&registry, listener(443));

        alice.close_all_listeners(&registry);
        assert!(alice.listener(80).is_none());
        assert!(registry.lookup("alice", 0).is_err());
        assert!(registry.lookup("web", 0).is_err());

        // A second teardown changes nothing.
        alice.close_all_listeners(&registry);
        assert!(registry.publishers().is_empty());
    }

    #[test]
    fn ports_are_reported_in_ascending_order() {
        let registry = Registry::new();
        let alice = publisher("alice", &[]);
        for port in [8080, 80, 443] {
            alice.create_listener(&registry, listener(port));
        }
        assert_eq!(alice.ports(), vec![80, 443, 8080]);
    }
}
