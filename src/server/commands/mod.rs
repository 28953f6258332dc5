//! Commands that can be executed through SSH to inspect and administrate the
//! server.

mod list;

use std::sync::Arc;

use async_trait::async_trait;
use slog::Logger;

use crate::auth::Permissions;
use crate::server::registry::Registry;

/// What a command gets to see of the session that runs it.
pub(crate) struct CommandContext {
    /// Permission set of the invoking connection.
    pub permissions: Permissions,
    /// The listener registry to report on.
    pub registry: Arc<Registry>,
    /// Logger of the invoking connection.
    pub logger: Logger,
}

/// The collected output of a finished command, written back over the session
/// channel by the caller.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

/// A single command verb.
#[async_trait]
pub(crate) trait CommandHandler: Send + Sync {
    async fn handle(&self, context: &CommandContext) -> CommandOutput;
}

/// Picks the handler for a command line, or for a bare shell request when the
/// client sent no command at all.
///
/// Only `list` exists so far, and every input resolves to it rather than
/// leaving interactive users in a dead shell. New verbs dispatch on the first
/// word of the command here.
pub(crate) fn dispatch(_command: Option<&str>) -> Box<dyn CommandHandler> {
    Box::new(list::List)
}
