//! Supervises a connection: tears down dead sessions and reconnects.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::link::DeathSignal;
use super::session::{self, Session, StopMode};
use super::{ConnectionState, Link};
use crate::error::ConnectionError;

/// Runs until the connection is closed or reconnection gives up.
pub(crate) async fn run(
    link: Arc<Link>,
    session: Session,
    mut deaths: mpsc::UnboundedReceiver<DeathSignal>,
    shutdown: CancellationToken,
) {
    let mut session = Some(session);

    loop {
        let signal = tokio::select! {
            _ = shutdown.cancelled() => break,
            signal = deaths.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        warn!(
            "Connection to {}:{} died in {}: {}",
            link.host(),
            link.port(),
            signal.source,
            signal.error
        );

        let was_connected = link.state() == ConnectionState::Connected;
        link.set_state(ConnectionState::Died);
        if let Some(dead) = session.take() {
            dead.shutdown(StopMode::Abort, was_connected).await;
        }

        // Both loops are gone; anything still queued is about the old socket.
        let mut stale = 0usize;
        while deaths.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "discarded extra death signals");
        }
        link.salvage_outbound().await;

        link.set_state(ConnectionState::Reconnecting);
        let policy = link.options().retry.clone();
        let reconnected = policy
            .retry(&shutdown, |attempt| {
                info!(
                    attempt,
                    "Reconnecting to {}:{}",
                    link.host(),
                    link.port()
                );
                session::establish(Arc::clone(&link))
            })
            .await;

        match reconnected {
            Ok(fresh) => {
                info!("Reconnected to {}:{}", link.host(), link.port());
                session = Some(fresh);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(link.options().reconnect_pause) => {}
                }
            }
            Err(ConnectionError::Closed) => break,
            Err(e) => {
                error!(
                    "Giving up on {}:{}: {}",
                    link.host(),
                    link.port(),
                    e
                );
                link.set_state(ConnectionState::Failed);
                link.close_inbound();
                return;
            }
        }
    }

    let was_connected = link.state() == ConnectionState::Connected;
    if let Some(live) = session.take() {
        live.shutdown(StopMode::Drain, was_connected).await;
    }
    link.set_state(ConnectionState::Closed);
    link.close_inbound();
    info!("Connection to {}:{} closed", link.host(), link.port());
}
