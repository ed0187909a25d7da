//! # Connection Pipeline
//!
//! Runs the five layers over one mediator connection.
//!
//! ```text
//! reader:    bytes -> L1 frames -> L2 mediator -> L3 session -> L4 keepalive -> L5 dispatch
//! writer:    L3 replies / task messages -> L3 encoder -> L2 -> L1 frames -> bytes
//! keepalive: idle timer -> echo requests, echo timeout
//! attach:    both logins complete -> connection handed to the task manager
//! ```
//!
//! All stages run inside one supervisor task. The first stage to finish ends the
//! connection: the others are dropped, the auth states are reset and the connection is
//! detached from the task manager. Replies produced while decoding are queued before the
//! decoded message is dispatched, and the writer drains them ahead of task traffic.

use crate::core::codec::FrameCodec;
use crate::core::frame::{D2mPayloadType, Frame};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::csp::CspPayload;
use crate::protocol::dispatch::Dispatcher;
use crate::protocol::handshake::client_hello;
use crate::protocol::keepalive::{Keepalive, KeepaliveDecoder, SharedKeepalive};
use crate::protocol::mediator::MediatorDecoder;
use crate::protocol::session::{
    OutboundL3Message, OutboundMessage, SessionDecoder, SessionEncoder, SharedTransport,
};
use crate::protocol::state::{AuthStates, CspAuthState};
use crate::task::codec::ConnectionHandle;
use crate::task::TaskManager;
use crate::utils::metrics::Metrics;
use crate::utils::time::unix_millis;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Per connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Permanent public key of the chat server
    pub server_public_key: [u8; 32],
}

/// Inbound layers 2 to 5
struct InboundLayers {
    mediator: MediatorDecoder,
    session: SessionDecoder,
    keepalive: KeepaliveDecoder,
    dispatcher: Dispatcher,
}

pub struct Pipeline;

impl Pipeline {
    /// Start a pipeline over `io`
    ///
    /// The CSP client-hello is generated here and is the first frame written.
    pub fn spawn<T>(io: T, context: ConnectionContext, manager: &TaskManager) -> Result<PipelineHandle>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let services = manager.services().clone();
        let config = &services.config;
        let metrics = services.metrics.clone();

        let states = AuthStates::new();
        let (hello_state, hello) = client_hello()?;
        states.set_csp(CspAuthState::ServerHello);

        let (l3_tx, l3_rx) = mpsc::channel(config.framing.channel_capacity);
        let (task_tx, task_rx) = mpsc::channel(config.framing.channel_capacity);
        let connection = manager.create_connection(task_tx);
        let generation = connection.generation();

        let transport: SharedTransport = Arc::new(OnceLock::new());
        let keepalive: SharedKeepalive = Arc::new(Mutex::new(Keepalive::new(
            config.session.echo_interval,
            config.session.client_idle_timeout,
            Instant::now(),
        )));

        let (read_half, write_half) = tokio::io::split(io);
        let codec = FrameCodec::from_config(&config.framing);
        let frames = FramedRead::new(read_half, codec);
        let sink = FramedWrite::new(write_half, codec);

        let layers = InboundLayers {
            mediator: MediatorDecoder::new(states.clone()),
            session: SessionDecoder::new(
                services.clone(),
                context.server_public_key,
                states.clone(),
                transport.clone(),
                hello_state,
            ),
            keepalive: KeepaliveDecoder::new(keepalive.clone(), metrics.clone()),
            dispatcher: Dispatcher::new(connection.clone(), manager.clone()),
        };
        let encoder = SessionEncoder::new(states.clone(), transport);

        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            states: states.clone(),
            connection: connection.clone(),
            manager: manager.clone(),
            metrics: metrics.clone(),
            cancel: cancel.clone(),
        };

        metrics.connection_established();
        info!(generation, "Pipeline started");

        let reader = read_stage(frames, layers, l3_tx.clone(), metrics.clone());
        let writer = write_stage(sink, hello, encoder, l3_rx, task_rx, metrics.clone());
        let timer = keepalive_stage(
            states.clone(),
            keepalive,
            l3_tx,
            config.session.server_idle_timeout,
            metrics.clone(),
        );
        let attach = attach_stage(states.clone(), connection, manager.clone(), metrics);

        let span = tracing::info_span!("pipeline", generation);
        let task = tokio::spawn(
            async move {
                let result = tokio::select! {
                    result = reader => result,
                    result = writer => result,
                    result = timer => result,
                    result = attach => result,
                    _ = supervisor.cancel.cancelled() => {
                        debug!("Pipeline closed locally");
                        Ok(())
                    }
                };
                supervisor.finish(result)
            }
            .instrument(span),
        );

        Ok(PipelineHandle {
            states,
            cancel,
            task,
        })
    }
}

struct Supervisor {
    states: AuthStates,
    connection: Arc<ConnectionHandle>,
    manager: TaskManager,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Supervisor {
    fn finish(self, result: Result<()>) -> Result<()> {
        self.cancel.cancel();
        if !self.states.is_authenticated() {
            self.metrics.handshake_failed();
        }
        self.states.reset();
        self.connection.close();
        self.manager.detach(self.connection.generation());
        self.metrics.connection_closed();

        match &result {
            Ok(()) => info!("Pipeline finished"),
            Err(e) => {
                self.metrics.protocol_error();
                if e.is_fatal() {
                    error!(error = %e, "Pipeline terminated");
                } else {
                    warn!(error = %e, "Pipeline terminated");
                }
            }
        }
        result
    }
}

/// Owner side of a running pipeline
#[derive(Debug)]
pub struct PipelineHandle {
    states: AuthStates,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl PipelineHandle {
    pub fn states(&self) -> &AuthStates {
        &self.states
    }

    pub fn authenticated(&self) -> bool {
        self.states.is_authenticated()
    }

    /// Stop every stage; [`PipelineHandle::closed`] then resolves with `Ok`
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the pipeline to end and return the error that ended it
    pub async fn closed(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ProtocolError::Custom(format!(
                "{}: {e}",
                constants::ERR_PIPELINE_STAGE_GONE
            ))),
        }
    }
}

async fn queue(replies: &mpsc::Sender<OutboundL3Message>, message: OutboundL3Message) -> Result<()> {
    replies
        .send(message)
        .await
        .map_err(|_| ProtocolError::Custom(constants::ERR_PIPELINE_STAGE_GONE.into()))
}

#[instrument(skip_all)]
async fn read_stage<R>(
    mut frames: FramedRead<R, FrameCodec>,
    mut layers: InboundLayers,
    replies: mpsc::Sender<OutboundL3Message>,
    metrics: Arc<Metrics>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut pending = Vec::new();
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        metrics.frame_received(frame.container_length() as u64);

        let message = layers.mediator.decode(frame)?;
        let message = match layers.session.decode(message, &mut pending)? {
            Some(message) => layers.keepalive.decode(message, &mut pending)?,
            None => None,
        };
        for reply in pending.drain(..) {
            queue(&replies, reply).await?;
        }
        if let Some(message) = message {
            layers.dispatcher.dispatch(message);
        }
    }
    debug!("Mediator closed the stream");
    Err(ProtocolError::ConnectionClosed)
}

async fn write_frame<W>(sink: &mut FramedWrite<W, FrameCodec>, frame: Frame, metrics: &Metrics) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let length = frame.container_length();
    sink.send(frame).await?;
    metrics.frame_sent(length as u64);
    Ok(())
}

#[instrument(skip_all)]
async fn write_stage<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    hello: Vec<u8>,
    mut encoder: SessionEncoder,
    mut replies: mpsc::Receiver<OutboundL3Message>,
    mut tasks: mpsc::Receiver<OutboundMessage>,
    metrics: Arc<Metrics>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(&mut sink, Frame::new(D2mPayloadType::Proxy, hello), &metrics).await?;
    debug!("CSP client-hello sent");

    loop {
        let message = tokio::select! {
            biased;
            message = replies.recv() => message,
            message = tasks.recv() => message.map(OutboundL3Message::Message),
        };
        let Some(message) = message else {
            return Err(ProtocolError::Custom(constants::ERR_PIPELINE_STAGE_GONE.into()));
        };
        let frame = encoder.encode(message)?.into_frame()?;
        write_frame(&mut sink, frame, &metrics).await?;
    }
}

/// Timer resolution of the keepalive stage
fn keepalive_tick(keepalive: &Keepalive) -> Duration {
    (keepalive.interval().min(keepalive.timeout()) / 4).max(Duration::from_millis(25))
}

#[instrument(skip_all)]
async fn keepalive_stage(
    states: AuthStates,
    keepalive: SharedKeepalive,
    replies: mpsc::Sender<OutboundL3Message>,
    server_idle_timeout: Duration,
    metrics: Arc<Metrics>,
) -> Result<()> {
    states.wait_authenticated().await;

    let seconds = u16::try_from(server_idle_timeout.as_secs()).unwrap_or(u16::MAX);
    queue(
        &replies,
        OutboundL3Message::Message(OutboundMessage::Csp(CspPayload::SetConnectionIdleTimeout(
            seconds,
        ))),
    )
    .await?;
    debug!(seconds, "Server idle timeout announced");

    let tick = {
        let mut keepalive = keepalive.lock().unwrap_or_else(PoisonError::into_inner);
        keepalive.on_inbound_activity(Instant::now());
        keepalive_tick(&keepalive)
    };
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let echo = {
            let mut keepalive = keepalive.lock().unwrap_or_else(PoisonError::into_inner);
            keepalive.check_timeout(now)?;
            keepalive.poll_echo(now, unix_millis())
        };
        if let Some(data) = echo {
            metrics.echo_request();
            queue(
                &replies,
                OutboundL3Message::Message(OutboundMessage::Csp(CspPayload::EchoRequest(data))),
            )
            .await?;
        }
    }
}

#[instrument(skip_all)]
async fn attach_stage(
    states: AuthStates,
    connection: Arc<ConnectionHandle>,
    manager: TaskManager,
    metrics: Arc<Metrics>,
) -> Result<()> {
    states.wait_authenticated().await;
    info!("Both logins complete");
    metrics.handshake_success();
    manager.attach(connection.clone());

    connection.closed().await;
    info!("Connection replaced by a newer one");
    Ok(())
}
