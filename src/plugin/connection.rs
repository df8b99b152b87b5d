//! Bidirectional RPC connection shared by host and plugin.
//!
//! One transport carries two independent roles on each side: outbound calls
//! (request/reply paired by frame id through a pending map) and inbound
//! calls dispatched to named services. Inbound calls are serviced on their
//! own task, so a plugin's UI callback can be handled while the host-side
//! caller is still blocked awaiting the outer response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::plugin::framing::{read_frame, write_frame};
use crate::plugin::protocol::{FaultKind, Frame, Payload, error_of, fault_of};

/// A named object servicing inbound calls from the peer.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError>;
}

enum WriterCommand {
    Frame(Frame),
    Shutdown,
}

type PendingMap = Mutex<HashMap<u64, (String, oneshot::Sender<Result<Value, CoreError>>)>>;

pub struct Connection {
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: Arc<PendingMap>,
    services: Arc<Mutex<HashMap<String, Arc<dyn Service>>>>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.closed.load(std::sync::atomic::Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Take ownership of a stream and start driving it. The reader and
    /// writer run as background tasks until the peer disconnects or
    /// [`Connection::close`] is called.
    pub fn new<S>(stream: S) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>(64);
        let (closed_tx, closed_rx) = watch::channel(false);

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let services: Arc<Mutex<HashMap<String, Arc<dyn Service>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_loop(write_half, writer_rx));
        tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&services),
            writer_tx.clone(),
            Arc::clone(&closed),
            closed_tx,
        ));

        Arc::new(Connection {
            writer_tx,
            pending,
            services,
            next_id: AtomicU64::new(0),
            closed,
            closed_rx,
        })
    }

    /// Register (or replace) the handler for inbound calls addressed to
    /// `name`. Registering per outer call scopes the callback-server role
    /// to that call's lifetime.
    pub fn register(&self, name: &str, service: Arc<dyn Service>) {
        self.services
            .lock()
            .expect("service table poisoned")
            .insert(name.to_string(), service);
    }

    /// Remove the handler for `name`. Later inbound calls to it receive a
    /// protocol fault instead of reaching a stale handler.
    pub fn unregister(&self, name: &str) {
        self.services
            .lock()
            .expect("service table poisoned")
            .remove(name);
    }

    /// Invoke `method` on the peer's service `name` and await the result.
    /// Fails with a communication error if the transport drops mid-call.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::comm(format!(
                "connection closed before call to {service}.{method}"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let context = format!("{service}.{method}");
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, (context.clone(), tx));

        let frame = Frame {
            id,
            payload: Payload::Call {
                service: service.to_string(),
                method: method.to_string(),
                params,
            },
        };
        if self.writer_tx.send(WriterCommand::Frame(frame)).await.is_err() {
            self.pending.lock().expect("pending map poisoned").remove(&id);
            return Err(CoreError::comm(format!(
                "connection closed before call to {context}"
            )));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::comm(format!(
                "connection closed during call to {context}"
            ))),
        }
    }

    /// Stop writing and signal the peer with a half-close. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once the peer disconnects (or the reader task stops).
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn writer_loop<W: AsyncWrite + Send + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriterCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Frame(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("rpc writer stopped: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_loop<R: AsyncRead + Send + Unpin>(
    mut reader: R,
    pending: Arc<PendingMap>,
    services: Arc<Mutex<HashMap<String, Arc<dyn Service>>>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    closed: Arc<AtomicBool>,
    closed_tx: watch::Sender<bool>,
) {
    let reason;
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match frame.payload {
                Payload::Call {
                    service,
                    method,
                    params,
                } => {
                    let handler = services
                        .lock()
                        .expect("service table poisoned")
                        .get(&service)
                        .cloned();
                    let writer_tx = writer_tx.clone();
                    let id = frame.id;
                    // Serviced off the reader task: a callback must be
                    // answerable while the peer's caller sits in our
                    // pending map.
                    tokio::spawn(async move {
                        let payload = match handler {
                            Some(svc) => match svc.call(&method, params).await {
                                Ok(result) => Payload::Reply { result },
                                Err(e) => {
                                    let (kind, message, detail) = fault_of(&e);
                                    Payload::Fault {
                                        kind,
                                        message,
                                        detail,
                                    }
                                }
                            },
                            None => Payload::Fault {
                                kind: FaultKind::Protocol,
                                message: format!("no service {service:?} registered"),
                                detail: None,
                            },
                        };
                        let _ = writer_tx
                            .send(WriterCommand::Frame(Frame { id, payload }))
                            .await;
                    });
                }
                Payload::Reply { result } => {
                    match pending.lock().expect("pending map poisoned").remove(&frame.id) {
                        Some((_, tx)) => {
                            let _ = tx.send(Ok(result));
                        }
                        None => warn!("unsolicited reply for call id {}", frame.id),
                    }
                }
                Payload::Fault {
                    kind,
                    message,
                    detail,
                } => {
                    match pending.lock().expect("pending map poisoned").remove(&frame.id) {
                        Some((context, tx)) => {
                            let _ =
                                tx.send(Err(decorate(error_of(kind, message, detail), &context)));
                        }
                        None => warn!("unsolicited fault for call id {}", frame.id),
                    }
                }
            },
            Ok(None) => {
                reason = "connection closed by peer".to_string();
                break;
            }
            Err(e) => {
                reason = e.to_string();
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let drained: Vec<_> = pending
        .lock()
        .expect("pending map poisoned")
        .drain()
        .collect();
    for (_, (context, tx)) in drained {
        let _ = tx.send(Err(CoreError::comm(format!(
            "{reason} during call to {context}"
        ))));
    }
    let _ = writer_tx.send(WriterCommand::Shutdown).await;
    let _ = closed_tx.send(true);
}

/// Attach the capability/method context to a transport-level fault so the
/// caller can tell which call died.
fn decorate(err: CoreError, context: &str) -> CoreError {
    match err {
        CoreError::PluginCommunication { context: inner, exit } => {
            CoreError::PluginCommunication {
                context: format!("{context}: {inner}"),
                exit,
            }
        }
        other => other,
    }
}
