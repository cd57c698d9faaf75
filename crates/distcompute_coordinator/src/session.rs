//! Per-connection worker session.
//!
//! Each accepted TCP connection runs as a pair of tasks: a reader that
//! drives the session's state machine (await registration, then loop on
//! heartbeats/results/errors) off `distcompute_protocol::framing::receive`,
//! and a writer that drains an `mpsc::Receiver<Message>` into
//! `framing::send`. Splitting the socket this way means only the writer
//! task ever calls `send`, so the dispatcher can hand a worker a message
//! without caring who else might be writing to the same stream at the
//! same time.

use std::net::SocketAddr;

use distcompute_protocol::{AuthFailedPayload, Message, RegisterWorkerPayload, WorkerRegisteredPayload};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::SessionError;

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Drive one worker connection end to end. Returns once the socket closes
/// or a protocol error ends the session; in both cases the worker (if it
/// ever registered) is reported dead to the dispatcher before returning.
pub async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Dispatcher,
    shared_token: Option<String>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
    }
    let (mut read_half, mut write_half) = stream.into_split();

    let registration =
        match await_registration(&mut read_half, &mut write_half, &shared_token).await {
            Ok(r) => r,
            Err(e) => {
                debug!(%peer_addr, error = %e, "session ended before registration completed");
                return;
            }
        };

    let worker_id = dispatcher
        .register_worker(
            registration.name,
            peer_addr,
            registration.max_concurrent_tasks,
            registration.outbound.clone(),
        )
        .await;

    if distcompute_protocol::framing::send(
        &mut write_half,
        &Message::WorkerRegistered(WorkerRegisteredPayload { worker_id }),
        None,
    )
    .await
    .is_err()
    {
        dispatcher.worker_dead(worker_id).await;
        return;
    }

    info!(%worker_id, %peer_addr, "worker registered");

    let writer_task = tokio::spawn(async move {
        let mut outbound_rx = registration.outbound_rx;
        while let Some(msg) = outbound_rx.recv().await {
            if distcompute_protocol::framing::send(&mut write_half, &msg, None)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        match distcompute_protocol::framing::receive(&mut read_half).await {
            Ok(Message::Heartbeat(hb)) => {
                dispatcher
                    .heartbeat(hb.worker_id, hb.in_flight, hb.completed_count)
                    .await;
            }
            Ok(Message::TaskResult(r)) => {
                dispatcher.task_result(worker_id, r.task_id, r.value).await;
            }
            Ok(Message::TaskError(e)) => {
                dispatcher
                    .task_error(worker_id, e.task_id, e.error_message)
                    .await;
            }
            Ok(Message::WorkerStatus(_)) => {
                // Informational only; nothing to update.
            }
            Ok(other) => {
                warn!(%worker_id, kind = ?other.kind(), "unexpected message from registered worker");
            }
            Err(e) => {
                info!(%worker_id, %peer_addr, error = %e, "worker session closed");
                break;
            }
        }
    }

    dispatcher.worker_dead(worker_id).await;
    writer_task.abort();
}

struct PendingRegistration {
    name: String,
    max_concurrent_tasks: u32,
    outbound: mpsc::Sender<Message>,
    outbound_rx: mpsc::Receiver<Message>,
}

async fn await_registration<R, W>(
    read_half: &mut R,
    write_half: &mut W,
    shared_token: &Option<String>,
) -> Result<PendingRegistration, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = distcompute_protocol::framing::receive(read_half).await?;
    let RegisterWorkerPayload {
        name,
        max_concurrent_tasks,
        token,
    } = match msg {
        Message::RegisterWorker(p) => p,
        other => return Err(SessionError::UnexpectedFirstMessage(other.kind())),
    };

    if let Some(expected) = shared_token {
        if token.as_ref() != Some(expected) {
            let reason = "invalid or missing token".to_string();
            let _ = distcompute_protocol::framing::send(
                write_half,
                &Message::AuthFailed(AuthFailedPayload {
                    reason: reason.clone(),
                }),
                None,
            )
            .await;
            let _ = write_half.shutdown().await;
            return Err(SessionError::AuthFailed(reason));
        }
    }

    let (outbound, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
    Ok(PendingRegistration {
        name,
        max_concurrent_tasks,
        outbound,
        outbound_rx,
    })
}
