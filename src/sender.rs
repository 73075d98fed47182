//! Outbound dispatch: the foreman and its sender pool.
//!
//! The foreman owns `max_workers` sender tasks and a ready-queue of free
//! sender slots. It only pops work off the backend queue when a sender is
//! free, which is the gateway's one back-pressure mechanism: with no free
//! sender, messages accumulate upstream. Each sender processes exactly one
//! message at a time; ordering across senders belongs to the backend queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::backend::Backend;
use crate::clog::{ChannelLog, ChannelLogType, ErrorCode, LogError};
use crate::error::SendError;
use crate::event::ChannelEventType;
use crate::handler::SendResult;
use crate::metrics;
use crate::msg::MsgOut;
use crate::registry::HandlerRegistry;
use crate::spool::write_to_spool;
use crate::status::{MsgStatus, StatusUpdate};

pub const DEFAULT_MAX_WORKERS: usize = 32;

/// Budget for one send attempt, slightly larger than the HTTP attempt
/// timeout so a slow provider cannot starve the status write.
const SEND_TIMEOUT: Duration = Duration::from_secs(35);

/// Fresh budget for the status and log writes after the attempt.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long one queue pop may block.
const POP_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after an empty pop before asking again.
const IDLE_SLEEP: Duration = Duration::from_millis(250);

/// Coordinates the sender pool. Created via [`Foreman::start`], torn down
/// via [`Foreman::stop`].
pub struct Foreman {
    quit: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Foreman {
    /// Spawn the assignment loop and `max_workers` senders.
    pub fn start(
        backend: Arc<dyn Backend>,
        registry: Arc<HandlerRegistry>,
        spool_dir: PathBuf,
        max_workers: usize,
    ) -> Foreman {
        let (quit_tx, quit_rx) = watch::channel(false);
        let (avail_tx, avail_rx) = mpsc::channel::<usize>(max_workers);
        let spool_dir = Arc::new(spool_dir);

        let mut tasks = JoinSet::new();
        let mut job_txs = Vec::with_capacity(max_workers);
        for idx in 0..max_workers {
            let (job_tx, job_rx) = mpsc::channel::<MsgOut>(1);
            job_txs.push(job_tx);
            tasks.spawn(sender_loop(
                idx,
                Arc::clone(&backend),
                Arc::clone(&registry),
                Arc::clone(&spool_dir),
                avail_tx.clone(),
                job_rx,
            ));
        }

        tasks.spawn(assignment_loop(backend, avail_tx, avail_rx, job_txs, quit_rx));
        tracing::info!(max_workers, "foreman started");

        Foreman {
            quit: quit_tx,
            tasks,
        }
    }

    /// Signal shutdown and wait for in-flight sends to finish.
    pub async fn stop(mut self) {
        let _ = self.quit.send(true);
        while self.tasks.join_next().await.is_some() {}
        tracing::info!("foreman stopped");
    }
}

/// Hands queued messages to free senders, one pop per free slot.
async fn assignment_loop(
    backend: Arc<dyn Backend>,
    avail_tx: mpsc::Sender<usize>,
    mut avail_rx: mpsc::Receiver<usize>,
    job_txs: Vec<mpsc::Sender<MsgOut>>,
    mut quit: watch::Receiver<bool>,
) {
    let mut idle_logged = false;

    loop {
        let idx = tokio::select! {
            _ = quit.changed() => break,
            maybe = avail_rx.recv() => match maybe {
                Some(idx) => idx,
                None => break,
            },
        };

        match tokio::time::timeout(POP_TIMEOUT, backend.pop_next_outgoing_msg()).await {
            Ok(Ok(Some(msg))) => {
                idle_logged = false;
                if job_txs[idx].send(msg).await.is_err() {
                    tracing::error!(sender = idx, "sender gone, stopping assignment");
                    break;
                }
            }
            outcome => {
                match outcome {
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "error popping next outgoing message");
                    }
                    _ if !idle_logged => {
                        tracing::debug!("no outgoing messages, sleeping");
                        idle_logged = true;
                    }
                    _ => {}
                }
                // slot stays free; put it back and let the queue fill up
                let _ = avail_tx.send(idx).await;
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                }
            }
        }
    }
    // dropping the job senders is the shutdown signal for the pool
}

/// One sender: publish the slot, wait for a job, process it. A closed job
/// channel is the shutdown signal.
async fn sender_loop(
    idx: usize,
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    spool_dir: Arc<PathBuf>,
    avail: mpsc::Sender<usize>,
    mut jobs: mpsc::Receiver<MsgOut>,
) {
    loop {
        if avail.send(idx).await.is_err() {
            // assignment loop is gone
            return;
        }
        let Some(msg) = jobs.recv().await else {
            tracing::debug!(sender = idx, "sender exiting");
            return;
        };
        process_msg(&*backend, &registry, &spool_dir, msg).await;
    }
}

/// The per-message send algorithm.
pub(crate) async fn process_msg(
    backend: &dyn Backend,
    registry: &HandlerRegistry,
    spool_dir: &Path,
    msg: MsgOut,
) {
    let start = Instant::now();

    let (status, mut clog, success) =
        match tokio::time::timeout(SEND_TIMEOUT, attempt_send(backend, registry, &msg)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let mut clog = ChannelLog::new(ChannelLogType::MsgSend, &msg.channel, &[]);
                clog.set_msg_id(msg.id);
                clog.error(LogError::new(
                    ErrorCode::InternalError,
                    "send attempt timed out".to_string(),
                ));
                let status =
                    backend.new_status_update(&msg.channel, msg.id, MsgStatus::Errored, &clog);
                (status, clog, false)
            }
        };

    metrics::record_send(msg.channel.channel_type.as_str(), start.elapsed(), success);

    // Status and log writes run on a guaranteed fresh budget so a timed-out
    // attempt cannot starve them.
    let writes = tokio::time::timeout(WRITE_TIMEOUT, async {
        if let Err(e) = backend.write_status_update(&status).await {
            tracing::info!(error = %e, msg_id = msg.id, "error writing status, spooling");
            if let Err(e) = write_to_spool(spool_dir, "statuses", &status).await {
                tracing::error!(error = %e, msg_id = msg.id, "error spooling status");
            }
        }
        clog.attach();
        clog.end();
        if let Err(e) = backend.write_channel_log(&clog).await {
            tracing::warn!(error = %e, msg_id = msg.id, "error writing channel log");
        }
    })
    .await;
    if writes.is_err() {
        tracing::warn!(msg_id = msg.id, "status and log writes timed out");
    }

    // Completion always runs exactly once per processed message, on its own
    // budget, so the queue slot is freed even when the writes misbehaved.
    match tokio::time::timeout(
        WRITE_TIMEOUT,
        backend.mark_outgoing_msg_complete(&msg, &status),
    )
    .await
    {
        Ok(Err(e)) => tracing::error!(error = %e, msg_id = msg.id, "error marking message complete"),
        Err(_) => tracing::error!(msg_id = msg.id, "marking message complete timed out"),
        Ok(Ok(())) => {}
    }
}

/// Run the dedup checks and the handler send, classifying the outcome into
/// a status update and a channel log.
async fn attempt_send(
    backend: &dyn Backend,
    registry: &HandlerRegistry,
    msg: &MsgOut,
) -> (StatusUpdate, ChannelLog, bool) {
    let channel = &msg.channel;

    if msg.is_resend {
        if let Err(e) = backend.clear_msg_sent(msg.id).await {
            tracing::error!(error = %e, msg_id = msg.id, "error clearing sent marker for resend");
        }
    }

    // Failsafe against double-queued messages. Advisory: on error we send.
    let already_sent = match backend.was_msg_sent(msg.id).await {
        Ok(sent) => sent,
        Err(e) => {
            tracing::error!(error = %e, msg_id = msg.id, "error checking sent marker");
            false
        }
    };

    if already_sent {
        tracing::warn!(msg_id = msg.id, "duplicate send, marking as wired");
        let mut clog = ChannelLog::new(ChannelLogType::MsgSend, channel, &[]);
        clog.set_msg_id(msg.id);
        let status = backend.new_status_update(channel, msg.id, MsgStatus::Wired, &clog);
        return (status, clog, true);
    }

    let Some(handler) = registry.get(&channel.channel_type) else {
        let mut clog = ChannelLog::new(ChannelLogType::MsgSend, channel, &[]);
        clog.set_msg_id(msg.id);
        clog.error(LogError::new(
            ErrorCode::InternalError,
            format!("no handler registered for channel type '{}'", channel.channel_type),
        ));
        let status = backend.new_status_update(channel, msg.id, MsgStatus::Failed, &clog);
        return (status, clog, false);
    };

    let mut clog = ChannelLog::new(ChannelLogType::MsgSend, channel, &handler.redact_values(channel));
    clog.set_msg_id(msg.id);
    let mut result = SendResult::default();

    let outcome = std::panic::AssertUnwindSafe(handler.send(backend, msg, &mut result, &mut clog))
        .catch_unwind()
        .await;

    let (status_kind, success) = match &outcome {
        Ok(Ok(())) => (MsgStatus::Wired, true),
        Ok(Err(e)) => {
            clog.error(e.log_error());
            (e.status(), false)
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(msg_id = msg.id, %reason, "panic during send");
            clog.error(LogError::new(
                ErrorCode::InternalError,
                format!("panic during send: {reason}"),
            ));
            (MsgStatus::Errored, false)
        }
    };

    let mut status = backend.new_status_update(channel, msg.id, status_kind, &clog);
    if let Some(ext_id) = result.external_id() {
        status.set_ext_id(ext_id);
    }
    if let Some(new_urn) = result.new_urn() {
        status.set_urn_update(msg.urn.clone(), new_urn.clone());
    }

    if matches!(&outcome, Ok(Err(SendError::ContactStopped))) {
        let event =
            backend.new_channel_event(channel, ChannelEventType::StopContact, msg.urn.clone(), &clog);
        if let Err(e) = backend.write_channel_event(&event).await {
            tracing::error!(error = %e, msg_id = msg.id, "error writing stop contact event");
        }
    }

    (status, clog, success)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::channel::Channel;
    use crate::msg::MsgOrigin;
    use crate::registry::{HandlerRegistry, RegistryBuilder};
    use crate::testing::{MockBackend, MockHandler, make_channel};
    use crate::urns::Urn;

    fn registry() -> HandlerRegistry {
        RegistryBuilder::new()
            .register(Arc::new(MockHandler::new()))
            .build(&[], &[])
    }

    fn outgoing(channel: Channel, id: crate::msg::MsgId) -> MsgOut {
        MsgOut::new(
            id,
            channel,
            Urn::parse("tel:+12065551212").expect("urn"),
            "hello world",
            MsgOrigin::Flow,
        )
    }

    async fn run_one(backend: &MockBackend, registry: &HandlerRegistry, msg: MsgOut) {
        let spool = tempfile::tempdir().expect("tempdir");
        process_msg(backend, registry, &spool.path().to_path_buf(), msg).await;
    }

    #[tokio::test]
    async fn duplicate_sends_short_circuit_to_wired() {
        let backend = MockBackend::new();
        let registry = registry();
        let channel = make_channel("MCK", serde_json::json!({"send_external_id": "prov-1"}));
        backend.add_channel(channel.clone());

        run_one(&backend, &registry, outgoing(channel.clone(), 10)).await;
        run_one(&backend, &registry, outgoing(channel, 10)).await;

        let state = backend.state();
        assert_eq!(state.written_statuses.len(), 2);
        assert_eq!(state.written_statuses[0].status, MsgStatus::Wired);
        assert_eq!(state.written_statuses[1].status, MsgStatus::Wired);
        // first attempt ran the handler, second did not
        assert_eq!(state.written_statuses[0].ext_id_assignment.as_deref(), Some("prov-1"));
        assert_eq!(state.written_statuses[1].ext_id_assignment, None);
        // and produced no external HTTP traffic
        assert!(state.written_logs[1].http_logs.is_empty());
        assert_eq!(state.completed.len(), 2);
    }

    #[tokio::test]
    async fn resend_clears_the_dedup_marker() {
        let backend = MockBackend::new();
        let registry = registry();
        let channel = make_channel("MCK", serde_json::json!({"send_external_id": "prov-2"}));
        backend.add_channel(channel.clone());

        run_one(&backend, &registry, outgoing(channel.clone(), 11)).await;
        run_one(
            &backend,
            &registry,
            outgoing(channel, 11).with_resend(true),
        )
        .await;

        let state = backend.state();
        assert_eq!(state.written_statuses.len(), 2);
        // the handler ran again on the resend
        assert_eq!(state.written_statuses[1].ext_id_assignment.as_deref(), Some("prov-2"));
    }

    #[tokio::test]
    async fn classifies_every_sentinel() {
        let cases = [
            ("channel_config", MsgStatus::Failed, ErrorCode::ChannelConfig),
            ("connection_failed", MsgStatus::Errored, ErrorCode::ConnectionFailed),
            ("connection_throttled", MsgStatus::Errored, ErrorCode::ConnectionThrottled),
            ("response_status", MsgStatus::Failed, ErrorCode::ResponseStatusCode),
            ("response_unparseable", MsgStatus::Failed, ErrorCode::ResponseUnparseable),
            ("response_unexpected", MsgStatus::Failed, ErrorCode::ResponseUnexpected),
            ("contact_stopped", MsgStatus::Failed, ErrorCode::ContactStopped),
            ("rejected", MsgStatus::Failed, ErrorCode::RejectedWithReason),
        ];

        for (config_error, expected_status, expected_code) in cases {
            let backend = MockBackend::new();
            let registry = registry();
            let channel = make_channel("MCK", serde_json::json!({"send_error": config_error}));
            backend.add_channel(channel.clone());

            run_one(&backend, &registry, outgoing(channel, 20)).await;

            let state = backend.state();
            assert_eq!(state.written_statuses.len(), 1, "case {config_error}");
            assert_eq!(state.written_statuses[0].status, expected_status, "case {config_error}");
            assert_eq!(state.written_logs.len(), 1, "case {config_error}");
            let errors = &state.written_logs[0].errors;
            assert_eq!(errors.len(), 1, "case {config_error}");
            assert_eq!(errors[0].code, expected_code, "case {config_error}");
        }
    }

    #[tokio::test]
    async fn rejected_with_reason_carries_provider_code() {
        let backend = MockBackend::new();
        let registry = registry();
        let channel = make_channel("MCK", serde_json::json!({"send_error": "rejected"}));
        backend.add_channel(channel.clone());

        run_one(&backend, &registry, outgoing(channel, 21)).await;

        let state = backend.state();
        assert_eq!(state.written_logs[0].errors[0].ext_code.as_deref(), Some("1890"));
    }

    #[tokio::test]
    async fn contact_stopped_writes_exactly_one_stop_event() {
        let backend = MockBackend::new();
        let registry = registry();
        let channel = make_channel("MCK", serde_json::json!({"send_error": "contact_stopped"}));
        backend.add_channel(channel.clone());

        let msg = outgoing(channel, 22);
        let urn = msg.urn.clone();
        run_one(&backend, &registry, msg).await;

        let state = backend.state();
        assert_eq!(state.written_statuses[0].status, MsgStatus::Failed);
        assert_eq!(state.written_events.len(), 1);
        assert_eq!(
            state.written_events[0].event_type,
            crate::event::ChannelEventType::StopContact
        );
        assert_eq!(state.written_events[0].urn, urn);
    }

    #[tokio::test]
    async fn missing_handler_fails_without_send() {
        let backend = MockBackend::new();
        let registry = RegistryBuilder::new().build(&[], &[]);
        let channel = make_channel("MCK", serde_json::json!({}));
        backend.add_channel(channel.clone());

        run_one(&backend, &registry, outgoing(channel, 23)).await;

        let state = backend.state();
        assert_eq!(state.written_statuses.len(), 1);
        assert_eq!(state.written_statuses[0].status, MsgStatus::Failed);
        assert_eq!(state.written_logs[0].errors[0].code, ErrorCode::InternalError);
        assert!(state.written_logs[0].http_logs.is_empty());
    }

    #[tokio::test]
    async fn wired_send_records_urn_rewrite() {
        let backend = MockBackend::new();
        let registry = registry();
        let channel = make_channel(
            "MCK",
            serde_json::json!({"send_new_urn": "tel:+15551112222"}),
        );
        backend.add_channel(channel.clone());

        run_one(&backend, &registry, outgoing(channel, 24)).await;

        let state = backend.state();
        let update = state.written_statuses[0].urn_update.as_ref().expect("rewrite");
        assert_eq!(update.0.as_str(), "tel:+12065551212");
        assert_eq!(update.1.as_str(), "tel:+15551112222");
    }

    #[tokio::test]
    async fn panicking_handler_classifies_as_errored() {
        let backend = MockBackend::new();
        let registry = registry();
        let channel = make_channel("MCK", serde_json::json!({"send_error": "panic"}));
        backend.add_channel(channel.clone());

        run_one(&backend, &registry, outgoing(channel, 25)).await;

        let state = backend.state();
        assert_eq!(state.written_statuses[0].status, MsgStatus::Errored);
        assert_eq!(state.written_logs[0].errors[0].code, ErrorCode::InternalError);
        // completion still happened
        assert_eq!(state.completed, vec![(25, MsgStatus::Errored)]);
    }

    #[tokio::test]
    async fn failed_status_write_spools_and_still_completes() {
        let backend = MockBackend::new();
        let registry = registry();
        let channel = make_channel("MCK", serde_json::json!({}));
        backend.add_channel(channel.clone());
        backend.set_fail_writes(true);

        let spool = tempfile::tempdir().expect("tempdir");
        process_msg(
            &backend,
            &registry,
            &spool.path().to_path_buf(),
            outgoing(channel, 26),
        )
        .await;

        let spooled: Vec<_> = std::fs::read_dir(spool.path().join("statuses"))
            .expect("spool dir")
            .collect();
        assert_eq!(spooled.len(), 1);
        let state = backend.state();
        assert!(state.written_statuses.is_empty());
        assert_eq!(state.completed, vec![(26, MsgStatus::Wired)]);
    }

    #[tokio::test]
    async fn foreman_drains_the_queue_and_stops_clean() {
        let backend = Arc::new(MockBackend::new());
        let registry = Arc::new(registry());
        let channel = make_channel("MCK", serde_json::json!({}));
        backend.add_channel(channel.clone());
        for id in 1..=5 {
            backend.queue_msg(outgoing(channel.clone(), id));
        }

        let spool = tempfile::tempdir().expect("tempdir");
        let foreman = Foreman::start(
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::clone(&registry),
            spool.path().to_path_buf(),
            2,
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if backend.state().completed.len() == 5 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "queue never drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        foreman.stop().await;

        let state = backend.state();
        assert_eq!(state.completed.len(), 5);
        assert!(state.completed.iter().all(|(_, s)| *s == MsgStatus::Wired));
    }
}
