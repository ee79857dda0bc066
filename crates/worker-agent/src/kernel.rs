//! The execution channel to the Jupyter kernel
//!
//! One kernel, one WebSocket, for the lifetime of the agent. A pump task
//! owns the socket and fans messages out: parsed kernel replies go to the
//! in-flight execution, pongs to the health check. Executes are serialized
//! on a mutex; stream-level pings bypass it so `/health` never waits on a
//! running execution.

use crate::reducer::{ExecutionAssembly, ExecutionOutcome, KernelMessage};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Jupyter server unreachable: {0}")]
    Unreachable(String),

    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    #[error("Kernel environment initialization failed: {0}")]
    Init(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Where the kernel lives and how long one execution may run.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub http_url: String,
    pub ws_url: String,
    pub execution_timeout: Duration,
}

impl KernelConfig {
    pub fn from_env() -> Self {
        let host =
            std::env::var("JUPYTER_HOST").unwrap_or_else(|_| "127.0.0.1:8888".to_string());
        let timeout_secs = std::env::var("EXECUTION_TIMEOUT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(10);
        Self {
            http_url: format!("http://{host}"),
            ws_url: format!("ws://{host}"),
            execution_timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KernelInfo {
    id: String,
}

const BOOT_MAX_RETRIES: u32 = 10;
const BOOT_RETRY_DELAY: Duration = Duration::from_secs(1);
const PING_TIMEOUT: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Headless plotting setup, run once per kernel before it serves traffic.
const KERNEL_INIT_CODE: &str = "import matplotlib\nmatplotlib.use('Agg')\n";

struct Session {
    kernel_id: String,
    outbound: mpsc::UnboundedSender<WsMessage>,
    inbound: mpsc::UnboundedReceiver<KernelMessage>,
    pump: JoinHandle<()>,
}

/// Cloneable handles for the health fast path.
struct Heartbeat {
    outbound: mpsc::UnboundedSender<WsMessage>,
    pong: watch::Receiver<u64>,
}

pub struct KernelClient {
    config: KernelConfig,
    http: reqwest::Client,
    /// Serializes executes, resets and reconnects.
    session: Mutex<Option<Session>>,
    /// Snapshot of the live channel for pings; never held across an await
    /// of the session lock.
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl KernelClient {
    pub fn new(config: KernelConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            session: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    /// Boots a kernel and prepares its environment. Retries while the
    /// Jupyter server itself is still coming up.
    pub async fn start(&self) -> KernelResult<()> {
        let mut slot = self.session.lock().await;
        self.start_locked(&mut slot).await
    }

    async fn start_locked(&self, slot: &mut Option<Session>) -> KernelResult<()> {
        if slot.is_some() {
            warn!("Kernel already started");
            return Ok(());
        }

        for attempt in 1..=BOOT_MAX_RETRIES {
            match self.boot_kernel().await {
                Ok(session) => {
                    *slot = Some(session);
                    info!("Initializing kernel environment");
                    match self.execute_locked(slot, KERNEL_INIT_CODE).await {
                        ExecutionOutcome::Text(_) => {
                            info!("Kernel environment initialized");
                            return Ok(());
                        }
                        other => {
                            error!(outcome = ?other, "Kernel environment initialization failed");
                            self.teardown_locked(slot).await;
                            return Err(KernelError::Init(format!("{other:?}")));
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_retries = BOOT_MAX_RETRIES,
                        error = %e,
                        "Could not start a kernel, retrying"
                    );
                    tokio::time::sleep(BOOT_RETRY_DELAY).await;
                }
            }
        }

        Err(KernelError::Unreachable(format!(
            "no kernel after {BOOT_MAX_RETRIES} attempts"
        )))
    }

    /// Runs one snippet, serialized against other executes.
    pub async fn execute(&self, code: &str) -> ExecutionOutcome {
        let mut slot = self.session.lock().await;
        self.execute_locked(&mut slot, code).await
    }

    async fn execute_locked(
        &self,
        slot: &mut Option<Session>,
        code: &str,
    ) -> ExecutionOutcome {
        // The channel may have died since the last call; reconnect to the
        // same kernel before giving up.
        let channel_down = slot
            .as_ref()
            .map(|s| s.outbound.is_closed() || s.pump.is_finished())
            .unwrap_or(true);
        if channel_down {
            let Some(previous) = slot.take() else {
                return ExecutionOutcome::ConnectionLost;
            };
            warn!("Kernel channel is down, reconnecting");
            previous.pump.abort();
            match self.connect_channels(previous.kernel_id).await {
                Ok(session) => *slot = Some(session),
                Err(e) => {
                    error!(error = %e, "Kernel reconnect failed");
                    return ExecutionOutcome::ConnectionLost;
                }
            }
        }
        let Some(session) = slot.as_mut() else {
            return ExecutionOutcome::ConnectionLost;
        };

        let msg_id = Uuid::new_v4().simple().to_string();
        let request = json!({
            "header": {
                "msg_id": msg_id,
                "username": "agent",
                "session": Uuid::new_v4().simple().to_string(),
                "msg_type": "execute_request",
                "version": "5.3",
            },
            "parent_header": {},
            "metadata": {},
            "content": {
                "code": code,
                "silent": false,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": false,
            },
            "buffers": [],
            "channel": "shell",
        });

        if session
            .outbound
            .send(WsMessage::text(request.to_string()))
            .is_err()
        {
            return ExecutionOutcome::ConnectionLost;
        }

        let mut assembly = ExecutionAssembly::new(msg_id);
        let completed = tokio::time::timeout(self.config.execution_timeout, async {
            while let Some(message) = session.inbound.recv().await {
                if assembly.absorb(&message) {
                    return true;
                }
            }
            false
        })
        .await;

        match completed {
            Ok(true) => assembly.into_outcome(),
            Ok(false) => {
                error!("Kernel channel closed mid-execution");
                ExecutionOutcome::ConnectionLost
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.execution_timeout.as_secs(),
                    "Code execution exceeded its budget"
                );
                ExecutionOutcome::TimedOut
            }
        }
    }

    /// Liveness of the kernel connection: a ping answered promptly.
    ///
    /// Deliberately does not take the session lock, so health checks keep
    /// answering while an execution is in flight.
    pub async fn is_healthy(&self) -> bool {
        let (outbound, mut pong) = {
            let heartbeat = self.heartbeat.lock().await;
            match heartbeat.as_ref() {
                Some(hb) => (hb.outbound.clone(), hb.pong.clone()),
                None => return false,
            }
        };

        pong.borrow_and_update();
        if outbound.send(WsMessage::Ping(Default::default())).is_err() {
            return false;
        }

        matches!(
            tokio::time::timeout(PING_TIMEOUT, pong.changed()).await,
            Ok(Ok(()))
        )
    }

    /// Tears the current kernel down and boots a fresh one.
    pub async fn reset(&self) -> bool {
        warn!("Resetting the Jupyter kernel");
        let mut slot = self.session.lock().await;
        self.teardown_locked(&mut slot).await;
        match self.start_locked(&mut slot).await {
            Ok(()) => {
                info!("Kernel reset complete");
                true
            }
            Err(e) => {
                error!(error = %e, "Kernel reset failed");
                false
            }
        }
    }

    async fn teardown_locked(&self, slot: &mut Option<Session>) {
        *self.heartbeat.lock().await = None;
        if let Some(session) = slot.take() {
            session.pump.abort();
            let url = format!("{}/api/kernels/{}", self.config.http_url, session.kernel_id);
            if let Err(e) = self.http.delete(&url).send().await {
                warn!(kernel_id = %session.kernel_id, error = %e, "Failed to delete kernel");
            }
        }
    }

    async fn boot_kernel(&self) -> KernelResult<Session> {
        let response = self
            .http
            .post(format!("{}/api/kernels", self.config.http_url))
            .json(&json!({ "name": "python3" }))
            .send()
            .await?
            .error_for_status()?;
        let kernel: KernelInfo = response.json().await?;
        info!(kernel_id = %kernel.id, "Jupyter kernel created");
        self.connect_channels(kernel.id).await
    }

    async fn connect_channels(&self, kernel_id: String) -> KernelResult<Session> {
        let url = format!("{}/api/kernels/{}/channels", self.config.ws_url, kernel_id);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| KernelError::Connect(e.to_string()))?;
        info!(kernel_id = %kernel_id, "WebSocket connection to kernel established");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = watch::channel(0u64);
        let pump = tokio::spawn(pump(ws, outbound_rx, inbound_tx, pong_tx));

        *self.heartbeat.lock().await = Some(Heartbeat {
            outbound: outbound_tx.clone(),
            pong: pong_rx,
        });

        Ok(Session {
            kernel_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
            pump,
        })
    }
}

/// Owns the WebSocket: writes queued outbound frames, routes inbound
/// frames to the execution channel and pongs to the health watch. Exits
/// when either side of the stream closes, which the client observes as a
/// closed channel.
async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
    inbound: mpsc::UnboundedSender<KernelMessage>,
    pong: watch::Sender<u64>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<KernelMessage>(text.as_str()) {
                        Ok(message) => {
                            if inbound.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "Discarding unparseable kernel message"),
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    pong.send_modify(|count| *count += 1);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Kernel stream error");
                    break;
                }
                None => {
                    warn!("Kernel stream closed");
                    break;
                }
            },
            queued = outbound.recv() => match queued {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        error!("Failed to write to the kernel stream");
                        break;
                    }
                }
                None => break,
            },
        }
    }
}
