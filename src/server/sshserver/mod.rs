//! Contains the [`Server`](crate::Server) struct used to configure and run a
//! switchboard instance, plus the accept loop wiring incoming connections to
//! their session handlers.

pub mod error;
pub mod options;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::server::Server as _;
use slog::o;
use tokio::net::TcpListener;

use crate::server::registry::Registry;
use crate::server::session::ClientHandler;
use self::error::ServerError;

/// An instance of the switchboard SSH server. It accepts connections on a
/// single port, authenticates them against the authorized keys file, and
/// splices `direct-tcpip` channels from initiating clients onto
/// `forwarded-tcpip` channels of publishing clients.
///
/// The server is created with [`Server::builder`] and started with the
/// [`listen`](Server::listen) method:
///
/// ```no_run
/// #[tokio::main]
/// async fn main() {
///     let server = nuttssh::Server::builder()
///         .bind_address("127.0.0.1:1878")
///         .build()
///         .unwrap();
///     server.listen().await.unwrap();
/// }
/// ```
pub struct Server {
    bind_address: SocketAddr,
    host_key_path: PathBuf,
    authorized_keys_path: PathBuf,
    logger: slog::Logger,
}

/// Used to create [`Server`]s.
pub struct ServerBuilder {
    bind_address: String,
    host_key_path: PathBuf,
    authorized_keys_path: PathBuf,
    logger: slog::Logger,
}

impl ServerBuilder {
    fn new() -> ServerBuilder {
        ServerBuilder {
            bind_address: options::DEFAULT_BIND_ADDRESS.to_string(),
            host_key_path: options::DEFAULT_HOST_KEY_FILE.into(),
            authorized_keys_path: options::DEFAULT_AUTHORIZED_KEYS_FILE.into(),
            logger: slog::Logger::root(slog::Discard, o!()),
        }
    }

    /// Sets the address and port to listen on.
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Sets the path of the host key file presented to clients.
    pub fn host_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_key_path = path.into();
        self
    }

    /// Sets the path of the authorized keys file, which is re-read for every
    /// authentication attempt.
    pub fn authorized_keys(mut self, path: impl Into<PathBuf>) -> Self {
        self.authorized_keys_path = path.into();
        self
    }

    /// Sets the logger the server and its connections will log to. Defaults
    /// to discarding everything.
    pub fn logger<L: Into<Option<slog::Logger>>>(mut self, logger: L) -> Self {
        self.logger = logger.into().unwrap_or_else(|| slog::Logger::root(slog::Discard, o!()));
        self
    }

    /// Validates the configuration and creates the [`Server`].
    pub fn build(self) -> Result<Server, ServerError> {
        Ok(Server {
            bind_address: self.bind_address.parse()?,
            host_key_path: self.host_key_path,
            authorized_keys_path: self.authorized_keys_path,
            logger: self.logger,
        })
    }
}

impl Server {
    /// Creates a builder with the default bind address and file paths.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds the configured address and serves connections until the process
    /// terminates. Errors are returned only for bootstrap failures; anything
    /// that goes wrong on an individual connection is logged and contained
    /// there.
    pub async fn listen(self) -> Result<(), ServerError> {
        let host_key = tokio::fs::read_to_string(&self.host_key_path).await?;
        let host_key = russh::keys::decode_secret_key(&host_key, None)?;

        let config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            inactivity_timeout: None,
            ..Default::default()
        });

        let socket = TcpListener::bind(self.bind_address).await?;
        slog::info!(self.logger, "Listening on {}", self.bind_address);

        let mut acceptor = Acceptor {
            registry: Arc::new(Registry::new()),
            authorized_keys_path: self.authorized_keys_path,
            logger: self.logger,
        };
        acceptor.run_on_socket(config, &socket).await?;
        Ok(())
    }
}

/// Creates one [`ClientHandler`] per incoming connection, all sharing the
/// same registry.
struct Acceptor {
    registry: Arc<Registry>,
    authorized_keys_path: PathBuf,
    logger: slog::Logger,
}

impl russh::server::Server for Acceptor {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ClientHandler {
        let logger = match peer_addr {
            Some(addr) => self.logger.new(o!("peer" => addr.to_string())),
            None => self.logger.clone(),
        };
        slog::info!(logger, "Connection received");
        ClientHandler::new(Arc::clone(&self.registry), self.authorized_keys_path.clone(), peer_addr, logger)
    }
}
