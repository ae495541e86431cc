//! Short-lived HTTP listener that waits for the operator to POST a public key.
//!
//! The accept loop runs as its own task. Validated keys are handed to the
//! waiting caller through a one-shot slot, so at most one key is delivered and
//! rejected submissions never touch the handoff. The listener is shut down and
//! joined before `wait_for_key` returns, whichever way it returns.

use super::{KeySource, PublicKey};
use crate::cancel::CancelSignal;
use crate::error::{TdxInitError, TdxInitResult};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::Router;
use log::{info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinError;

/// Key source backed by a single-purpose HTTP listener.
#[derive(Debug, Clone)]
pub struct WebServerKey {
    addr: SocketAddr,
}

impl WebServerKey {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

/// Outcome of handing a validated key to the waiter.
enum Delivery {
    Accepted,
    AlreadyReceived,
    WaiterGone,
}

/// Single-slot rendezvous between request handlers and the waiting caller.
#[derive(Clone)]
struct KeyHandoff {
    slot: Arc<Mutex<Option<oneshot::Sender<PublicKey>>>>,
}

impl KeyHandoff {
    fn new(tx: oneshot::Sender<PublicKey>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    fn deliver(&self, key: PublicKey) -> Delivery {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            None => Delivery::AlreadyReceived,
            Some(tx) => match tx.send(key) {
                Ok(()) => Delivery::Accepted,
                Err(_) => Delivery::WaiterGone,
            },
        }
    }
}

async fn submit_key(
    State(handoff): State<KeyHandoff>,
    method: Method,
    body: Bytes,
) -> (StatusCode, &'static str) {
    if method != Method::POST {
        warn!("rejected {method} request on key listener");
        return (StatusCode::METHOD_NOT_ALLOWED, "Only POST method is allowed");
    }

    let key = match std::str::from_utf8(&body)
        .map_err(|err| TdxInitError::InvalidKey(err.to_string()))
        .and_then(PublicKey::parse)
    {
        Ok(key) => key,
        Err(err) => {
            warn!("rejected key submission: {err}");
            return (
                StatusCode::BAD_REQUEST,
                "Invalid key format, expected base64-encoded OpenSSH ed25519 public key",
            );
        }
    };

    let fingerprint = key.fingerprint();
    match handoff.deliver(key) {
        Delivery::Accepted => {
            info!("accepted public key sha256:{fingerprint}");
            (StatusCode::OK, "Key received and stored successfully")
        }
        Delivery::AlreadyReceived => {
            warn!("ignored public key sha256:{fingerprint}; a key was already received");
            (StatusCode::CONFLICT, "A key has already been received")
        }
        Delivery::WaiterGone => (
            StatusCode::SERVICE_UNAVAILABLE,
            "No longer waiting for a key",
        ),
    }
}

/// What woke the waiting caller.
enum Wake {
    Cancelled,
    Key(Result<PublicKey, oneshot::error::RecvError>),
    ListenerExited(String),
}

fn describe_exit<E: fmt::Display>(exit: Result<Result<(), E>, JoinError>) -> String {
    match exit {
        Ok(Ok(())) => "listener exited".to_string(),
        Ok(Err(err)) => err.to_string(),
        Err(err) => format!("listener task failed: {err}"),
    }
}

#[async_trait]
impl KeySource for WebServerKey {
    async fn wait_for_key(&self, cancel: &CancelSignal) -> TdxInitResult<PublicKey> {
        if cancel.is_cancelled() {
            return Err(TdxInitError::Cancelled);
        }

        let builder = axum::Server::try_bind(&self.addr).map_err(|err| {
            TdxInitError::Transport(format!("unable to listen on {}: {err}", self.addr))
        })?;

        let (key_tx, key_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = Router::new()
            .fallback(submit_key)
            .with_state(KeyHandoff::new(key_tx));
        let server = builder
            .serve(app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
        let mut server = tokio::spawn(server);
        info!("waiting for public key on http://{}", self.addr);

        let wake = tokio::select! {
            _ = cancel.cancelled() => Wake::Cancelled,
            received = key_rx => Wake::Key(received),
            exited = &mut server => Wake::ListenerExited(describe_exit(exited)),
        };

        let result = match wake {
            Wake::ListenerExited(reason) => {
                return Err(TdxInitError::Transport(format!(
                    "key listener on {} stopped: {reason}",
                    self.addr
                )));
            }
            Wake::Cancelled => Err(TdxInitError::Cancelled),
            Wake::Key(Ok(key)) => Ok(key),
            Wake::Key(Err(_)) => Err(TdxInitError::Transport(
                "key listener dropped the handoff".to_string(),
            )),
        };

        let _ = shutdown_tx.send(());
        match server.await {
            Ok(Ok(())) => info!("key listener on {} shut down", self.addr),
            other => warn!(
                "key listener on {} did not shut down cleanly: {}",
                self.addr,
                describe_exit(other)
            ),
        }
        result
    }
}
