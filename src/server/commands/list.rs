//! The `list` command: shows the clients that currently publish virtual
//! listeners.

use std::fmt::Write;

use async_trait::async_trait;

use super::{CommandContext, CommandHandler, CommandOutput};
use crate::auth::Permissions;

pub(crate) struct List;

#[async_trait]
impl CommandHandler for List {
    async fn handle(&self, context: &CommandContext) -> CommandOutput {
        if !context.permissions.contains(Permissions::LIST_LISTENERS) {
            slog::debug!(context.logger, "No LIST_LISTENERS permission, refusing list");
            return CommandOutput {
                stderr: "Permission denied\n".to_string(),
                exit_status: 1,
                ..CommandOutput::default()
            };
        }

        let mut publishers = context.registry.publishers();
        publishers.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let mut stdout = String::from("Listening clients:\n");
        if publishers.is_empty() {
            stdout.push_str("  None\n");
        } else {
            for publisher in publishers {
                let ip = match publisher.peer {
                    Some(addr) => addr.ip().to_string(),
                    None => "unknown".to_string(),
                };
                let ports: Vec<String> = publisher.ports().iter().map(u16::to_string).collect();
                let _ = writeln!(
                    stdout,
                    "  {}: ip={} aliases={} ports={}",
                    publisher.hostname,
                    ip,
                    publisher.aliases.join(","),
                    ports.join(","),
                );
            }
        }
        CommandOutput {
            stdout,
            ..CommandOutput::default()
        }
    }
}
