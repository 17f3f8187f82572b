// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! Wraps a `lapin::Connection` and turns its error callback into a close
//! notification that fires exactly once. The notification carries the broker
//! reply code when the broker closed the connection, a `FRAME_ERROR` when the
//! transport failed, and nothing when the application closed it itself.
//!
//! lapin only reports protocol-level closures through its error callback. A
//! background watcher polls the connection status and fires a clean
//! notification for any other closure.

use crate::{classifier::FRAME_ERROR, errors::AmqpError};
use lapin::{Channel, Connection};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::oneshot, time::interval};
use tracing::{debug, error, warn};

/// Reply code used for a clean, caller-initiated close.
pub const REPLY_SUCCESS: u16 = 200;
/// How often the connection status is checked for silent closures.
pub const CLOSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Code and reason reported when a connection goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: String,
}

impl From<&lapin::Error> for CloseNotice {
    fn from(err: &lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(amqp) => CloseNotice {
                code: amqp.get_id(),
                reason: amqp.get_message().to_string(),
            },
            other => CloseNotice {
                code: FRAME_ERROR,
                reason: other.to_string(),
            },
        }
    }
}

impl From<&CloseNotice> for AmqpError {
    fn from(notice: &CloseNotice) -> Self {
        AmqpError::BrokerClosed {
            code: notice.code,
            reason: notice.reason.clone(),
        }
    }
}

/// Receiving half of a close notification.
///
/// Resolves once with `Some(notice)` for an error closure or `None` for a clean
/// one. A dropped notifier resolves with a `RecvError`, which callers treat as a
/// clean closure.
pub type CloseSignal = oneshot::Receiver<Option<CloseNotice>>;

/// Sending half of a close notification. Cloneable, only the first `fire` wins.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    tx: Arc<Mutex<Option<oneshot::Sender<Option<CloseNotice>>>>>,
}

impl CloseNotifier {
    /// Delivers the notice if nothing was delivered yet. Returns whether this call
    /// delivered it.
    pub fn fire(&self, notice: Option<CloseNotice>) -> bool {
        let sender = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(tx) => tx.send(notice).is_ok(),
            None => false,
        }
    }

    /// Whether firing can no longer deliver anything: already fired, or the
    /// signal was dropped.
    pub fn is_settled(&self) -> bool {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        guard.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Fires a clean close notification once `closed` reports true.
///
/// Returns as soon as the notifier is settled, so a closure already reported
/// with its error code is never overwritten.
pub(crate) async fn watch_closure<F>(closed: F, notifier: CloseNotifier, every: Duration)
where
    F: Fn() -> bool + Send + 'static,
{
    let mut ticks = interval(every);

    loop {
        ticks.tick().await;

        if notifier.is_settled() {
            return;
        }

        if closed() {
            debug!("connection closed without an error");
            notifier.fire(None);
            return;
        }
    }
}

/// Creates a connected notifier/signal pair.
pub fn close_notification() -> (CloseNotifier, CloseSignal) {
    let (tx, rx) = oneshot::channel();
    (
        CloseNotifier {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

/// A live connection to the broker.
pub struct BrokerConnection {
    inner: Connection,
    notifier: CloseNotifier,
    signal: Mutex<Option<CloseSignal>>,
}

impl BrokerConnection {
    pub(crate) fn new(inner: Connection) -> Self {
        let (notifier, signal) = close_notification();

        let on_error = notifier.clone();
        inner.on_error(move |err| {
            let notice = CloseNotice::from(&err);
            warn!(
                code = notice.code,
                reason = %notice.reason,
                "amqp connection error"
            );
            on_error.fire(Some(notice));
        });

        let status = inner.status().clone();
        tokio::spawn(watch_closure(
            move || status.closed(),
            notifier.clone(),
            CLOSE_POLL_INTERVAL,
        ));

        BrokerConnection {
            inner,
            notifier,
            signal: Mutex::new(Some(signal)),
        }
    }

    /// Takes the close signal of this connection. Only the first caller gets it,
    /// one supervisor watches one connection.
    pub fn close_signal(&self) -> Option<CloseSignal> {
        match self.signal.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    /// Opens a new channel on this connection.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Closes the connection from the application side.
    ///
    /// The close notification fires with no error before the broker handshake so
    /// a watching supervisor sees a clean closure.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.notifier.fire(None);

        if !self.is_connected() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

/// Closes a channel, logging instead of failing.
pub(crate) async fn close_channel_quietly(channel: &Channel) {
    if !channel.status().connected() {
        return;
    }

    if let Err(err) = channel.close(REPLY_SUCCESS, "closing").await {
        debug!(error = err.to_string(), "channel already gone");
    }
}
