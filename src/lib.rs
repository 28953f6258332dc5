#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! Nuttssh is an SSH switchboard server: a single always-on endpoint that many
//! clients connect to, where some clients publish virtual listening ports and
//! others open connections to them. The advertised ports are never bound on
//! the host OS; they exist only inside the SSH session graph, and the server
//! splices traffic between the two connections involved.
//!
//! A client with the `listen` access level requests a remote port forward
//! (`ssh -R`), which registers a *virtual listener* under the client's
//! configured name. A client with the `initiate` access level then opens a
//! local forward (`ssh -L` or `-W`) whose destination host names the listening
//! client, and the server delivers the connection to it as a
//! `forwarded-tcpip` channel:
//!
//! ```sh
//! # On the publishing machine (key has access=listen,hostname=alice):
//! ssh -p 1878 -R 22:ignored:22 switchboard.example.org
//!
//! # On the initiating machine (key has access=initiate):
//! ssh -p 1878 -W alice:22 switchboard.example.org
//! ```
//!
//! When several clients publish under the same name, `alice~1`, `alice~2`, …
//! select the older ones; the bare name always reaches the most recently
//! connected publisher.
//!
//! It runs on top of the Tokio asynchronous run-time, with the SSH transport
//! provided by [`russh`].

pub mod auth;
pub(crate) mod server;

pub use crate::server::sshserver::{Server, ServerBuilder, error::ServerError, options};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
