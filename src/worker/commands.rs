//! Command channel listener.
//!
//! Each served queue has a pub/sub topic. Commands addressed to this worker
//! (or to every worker) are acted on; anything else is ignored.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Command, CommandAction};
use crate::store::Subscription;

/// What the worker should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Stop,
}

/// Decide how `worker_id` reacts to a raw command payload.
pub fn interpret(payload: &str, worker_id: &str) -> Directive {
    let command: Command = match serde_json::from_str(payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "ignoring malformed command");
            return Directive::Continue;
        }
    };

    if !command.is_for(worker_id) {
        return Directive::Continue;
    }

    match command.action {
        CommandAction::Shutdown => {
            info!(worker_id, key = %command.key, "shutdown command received");
            Directive::Stop
        }
        CommandAction::Unknown(action) => {
            warn!(worker_id, action = %action, "unsupported command");
            Directive::Continue
        }
    }
}

/// Consume `subscription` until a shutdown command arrives or `shutdown` is
/// cancelled elsewhere. A shutdown command cancels `shutdown`.
///
/// A subscription that ends on its own also cancels `shutdown` and returns a
/// connection error: a worker that cannot hear commands must not keep running.
pub async fn listen(
    mut subscription: Subscription,
    worker_id: String,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = subscription.next() => message,
        };

        let Some(message) = message else {
            error!(worker_id = %worker_id, "command subscription closed, stopping worker");
            shutdown.cancel();
            return Err(Error::StoreConnection(
                "command subscription closed".to_string(),
            ));
        };

        debug!(topic = %message.topic, "command message");
        if interpret(&message.payload, &worker_id) == Directive::Stop {
            shutdown.cancel();
            return Ok(());
        }
    }
}
