//! Splices two SSH channels on different connections into one circuit.

use russh::Channel;
use russh::server::Msg;
use slog::Logger;
use tokio::io::copy_bidirectional;

/// Pumps bytes between the initiator's `direct-tcpip` channel and the
/// publisher's `forwarded-tcpip` channel until both directions have seen EOF
/// or either side fails. Payload bytes pass through untouched, a half-close
/// on one side closes only the matching direction on the other, and a slow
/// reader holds back its writer instead of buffering without bound.
pub(crate) async fn splice(inbound: Channel<Msg>, outbound: Channel<Msg>, logger: Logger) {
    let mut initiator = inbound.into_stream();
    let mut publisher = outbound.into_stream();
    match copy_bidirectional(&mut initiator, &mut publisher).await {
        Ok((to_publisher, to_initiator)) => {
            slog::info!(logger, "Circuit closed, {} bytes out, {} bytes back", to_publisher, to_initiator);
        }
        Err(err) => {
            slog::error!(logger, "Circuit failed: {}", err);
        }
    }
}
