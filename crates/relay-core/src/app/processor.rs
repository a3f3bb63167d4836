//! Processor - queue からの push 型 consume
//!
//! # 構成
//! - **pump**: transport から receive し、bounded channel（prefetch）に積む
//! - **workers**: `max_concurrent_calls` 本。channel から取り出して handler を呼ぶ
//! - **error task**: 全ステージのエラーを 1 本の channel で受け、error handler に渡す
//!
//! # 設計原則
//! - handler の呼び出しは 1 回ごとに別 task（panic はそこで止まる）
//! - stop は新しい receive を止め、実行中の handler の終了を待つ
//! - stop 時に channel に残った未配送 message は abandon して即座に返す
//! - lease の期限切れによる再配送は transport の責務

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::app::client::{ActivityGuard, ClientInner};
use crate::app::handler::{
    ErrorHandler, ErrorSource, MessageHandler, ProcessError, ProcessErrorContext,
    ProcessMessageContext,
};
use crate::domain::{DeliveryError, HandlerError, MessageId, ProcessorState, ReceivedMessage};
use crate::ports::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Number of handler invocations that may run at once.
    pub max_concurrent_calls: usize,
    /// Messages received ahead of the workers. Defaults to `max_concurrent_calls`.
    pub prefetch: Option<usize>,
    /// Longest single receive wait, also the back-off after a receive error.
    pub receive_wait: Duration,
    /// Complete the message when the handler returns `Ok` without settling it.
    pub auto_complete: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            prefetch: None,
            receive_wait: Duration::from_secs(1),
            auto_complete: false,
        }
    }
}

impl ProcessorOptions {
    fn channel_capacity(&self) -> usize {
        self.prefetch.unwrap_or(self.max_concurrent_calls).max(1)
    }
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("{0} handler is not registered")]
    MissingHandler(&'static str),

    #[error("invalid processor options: {0}")]
    InvalidOptions(String),

    #[error("processor cannot start while {0:?}")]
    InvalidState(ProcessorState),

    #[error("client is closed")]
    Closed,
}

/// Builds a [`Processor`]. Both handlers are required.
pub struct ProcessorBuilder {
    queue: String,
    client: Arc<ClientInner>,
    options: ProcessorOptions,
    message_handler: Option<Arc<dyn MessageHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ProcessorBuilder {
    pub(crate) fn new(queue: String, client: Arc<ClientInner>) -> Self {
        Self {
            queue,
            client,
            options: ProcessorOptions::default(),
            message_handler: None,
            error_handler: None,
        }
    }

    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_message(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.message_handler = Some(Arc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Processor, ProcessorError> {
        let message_handler = self
            .message_handler
            .ok_or(ProcessorError::MissingHandler("message"))?;
        let error_handler = self
            .error_handler
            .ok_or(ProcessorError::MissingHandler("error"))?;
        if self.options.max_concurrent_calls == 0 {
            return Err(ProcessorError::InvalidOptions(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }

        let (state, _) = watch::channel(ProcessorState::Stopped);
        Ok(Processor {
            dispatch: Arc::new(Dispatch {
                queue: self.queue,
                transport: Arc::clone(self.client.transport()),
                message_handler,
                auto_complete: self.options.auto_complete,
            }),
            error_handler,
            options: self.options,
            client: self.client,
            state,
            running: None,
        })
    }
}

/// Push-style consumer for one queue.
///
/// `start` spawns the pump and workers; `stop` drains them. Dropping a running
/// processor requests shutdown without waiting; the client refuses `dispose`
/// until those tasks (and any handler still running) have finished.
pub struct Processor {
    dispatch: Arc<Dispatch>,
    error_handler: Arc<dyn ErrorHandler>,
    options: ProcessorOptions,
    client: Arc<ClientInner>,
    state: watch::Sender<ProcessorState>,
    running: Option<RunningTasks>,
}

struct RunningTasks {
    shutdown_tx: watch::Sender<bool>,
    pump: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    error_task: JoinHandle<()>,
    errors: ErrorSink,
    buffered: flume::Receiver<ReceivedMessage>,
    // 各 task も clone を持つ。全部終わるまで client の dispose を止める
    activity: Arc<ActivityGuard>,
}

impl Processor {
    pub fn queue(&self) -> &str {
        &self.dispatch.queue
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state.subscribe()
    }

    /// Begin receiving and dispatching. Only valid while `Stopped`.
    pub async fn start(&mut self) -> Result<(), ProcessorError> {
        let current = self.state();
        if current.is_active() {
            return Err(ProcessorError::InvalidState(current));
        }
        let activity = Arc::new(self.client.acquire().ok_or(ProcessorError::Closed)?);
        self.state.send_replace(ProcessorState::Starting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (message_tx, message_rx) = flume::bounded(self.options.channel_capacity());
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let errors = ErrorSink {
            queue: self.dispatch.queue.clone(),
            tx: error_tx,
        };

        let error_task = tokio::spawn(error_loop(
            error_rx,
            Arc::clone(&self.error_handler),
            Arc::clone(&activity),
        ));
        let pump = tokio::spawn(pump_loop(
            Arc::clone(&self.dispatch),
            self.options.receive_wait,
            message_tx,
            errors.clone(),
            shutdown_rx.clone(),
            Arc::clone(&activity),
        ));
        let workers = (0..self.options.max_concurrent_calls)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&self.dispatch),
                    message_rx.clone(),
                    errors.clone(),
                    shutdown_rx.clone(),
                    Arc::clone(&activity),
                ))
            })
            .collect();

        self.running = Some(RunningTasks {
            shutdown_tx,
            pump,
            workers,
            error_task,
            errors,
            buffered: message_rx,
            activity,
        });
        self.state.send_replace(ProcessorState::Running);

        info!(
            queue = %self.dispatch.queue,
            max_concurrent_calls = self.options.max_concurrent_calls,
            prefetch = self.options.channel_capacity(),
            "processor started"
        );
        Ok(())
    }

    /// Stop receiving, wait for in-flight handlers, release prefetched
    /// messages. No-op when already stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.state.send_replace(ProcessorState::Stopping);
        let queue = self.dispatch.queue.clone();

        // ignore send error: receivers may already be gone
        let _ = running.shutdown_tx.send(true);
        join_logged(running.pump, "pump").await;
        for worker in running.workers {
            join_logged(worker, "worker").await;
        }

        // channel に残っている message は誰にも渡っていない
        let mut released = 0usize;
        while let Ok(message) = running.buffered.try_recv() {
            match self
                .dispatch
                .transport
                .abandon(&queue, message.lease(), Some("processor stopped".to_string()))
                .await
            {
                Ok(()) => released += 1,
                Err(err) => running
                    .errors
                    .report(ErrorSource::Abandon, err.into(), Some(message.id())),
            }
        }

        // 最後の sender を落として error task を終わらせる
        drop(running.errors);
        join_logged(running.error_task, "error handler").await;
        drop(running.activity);

        self.state.send_replace(ProcessorState::Stopped);
        info!(queue = %queue, released, "processor stopped");
    }

    /// Run until `signal` resolves, then stop.
    pub async fn run_until<F: Future>(&mut self, signal: F) -> Result<(), ProcessorError> {
        self.start().await?;
        let _ = signal.await;
        self.stop().await;
        Ok(())
    }

    pub async fn run_for(&mut self, duration: Duration) -> Result<(), ProcessorError> {
        self.run_until(tokio::time::sleep(duration)).await
    }

    /// Stop (if running) and release the processor.
    pub async fn dispose(mut self) {
        self.stop().await;
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
            warn!(queue = %self.dispatch.queue, "processor dropped while running");
        }
    }
}

async fn join_logged(handle: JoinHandle<()>, task: &str) {
    if let Err(err) = handle.await {
        error!(task, error = %err, "processor task failed");
    }
}

/// Everything a worker needs to dispatch one delivery.
struct Dispatch {
    queue: String,
    transport: Arc<dyn Transport>,
    message_handler: Arc<dyn MessageHandler>,
    auto_complete: bool,
}

impl Dispatch {
    async fn invoke(
        &self,
        worker_id: usize,
        message: ReceivedMessage,
        errors: &ErrorSink,
        activity: &Arc<ActivityGuard>,
    ) {
        let message_id = message.id();
        debug!(
            worker_id,
            message_id = %message_id,
            delivery_count = message.delivery_count(),
            "dispatching message"
        );

        let ctx = ProcessMessageContext::new(self.queue.clone(), message, Arc::clone(&self.transport));
        let handler = Arc::clone(&self.message_handler);
        let activity = Arc::clone(activity);
        let invocation = tokio::spawn(async move {
            let result = handler.handle(&ctx).await;
            drop(activity);
            (ctx, result)
        });

        match invocation.await {
            Ok((ctx, Ok(()))) => {
                if self.auto_complete && !ctx.is_settled() {
                    if let Err(err) = ctx.complete(ctx.message()).await {
                        errors.report(ErrorSource::Complete, err.into(), Some(message_id));
                    }
                }
            }
            Ok((_, Err(err))) => {
                errors.report(ErrorSource::UserCallback, err.into(), Some(message_id));
            }
            Err(join_err) => {
                let panicked = HandlerError::Panicked(panic_message(join_err));
                errors.report(ErrorSource::UserCallback, panicked.into(), Some(message_id));
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[derive(Clone)]
struct ErrorSink {
    queue: String,
    tx: mpsc::UnboundedSender<ProcessErrorContext>,
}

impl ErrorSink {
    fn report(&self, source: ErrorSource, error: ProcessError, message_id: Option<MessageId>) {
        debug!(queue = %self.queue, ?source, %error, "routing error to error handler");
        let ctx = ProcessErrorContext {
            queue: self.queue.clone(),
            source,
            error,
            message_id,
        };
        if self.tx.send(ctx).is_err() {
            warn!(queue = %self.queue, "error handler is gone; error dropped");
        }
    }
}

async fn error_loop(
    mut rx: mpsc::UnboundedReceiver<ProcessErrorContext>,
    handler: Arc<dyn ErrorHandler>,
    _activity: Arc<ActivityGuard>,
) {
    while let Some(ctx) = rx.recv().await {
        let handler = Arc::clone(&handler);
        let invocation = tokio::spawn(async move { handler.on_error(&ctx).await });
        if let Err(err) = invocation.await {
            error!(error = %panic_message(err), "error handler panicked");
        }
    }
}

async fn pump_loop(
    dispatch: Arc<Dispatch>,
    receive_wait: Duration,
    tx: flume::Sender<ReceivedMessage>,
    errors: ErrorSink,
    mut shutdown_rx: watch::Receiver<bool>,
    _activity: Arc<ActivityGuard>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let received = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = dispatch.transport.receive(&dispatch.queue, receive_wait) => received,
        };

        match received {
            Ok(Some(message)) => {
                let (lease, message_id) = (message.lease(), message.id());
                // channel が満杯なら worker が空くまで待つ
                let handed_over = tokio::select! {
                    biased;
                    sent = tx.send_async(message) => sent.is_ok(),
                    _ = shutdown_rx.changed() => false,
                };
                if !handed_over {
                    let released = dispatch
                        .transport
                        .abandon(&dispatch.queue, lease, Some("processor stopping".to_string()))
                        .await;
                    if let Err(err) = released {
                        errors.report(ErrorSource::Abandon, err.into(), Some(message_id));
                    }
                }
            }
            Ok(None) => {}
            Err(DeliveryError::Closed) => {
                errors.report(ErrorSource::Receive, DeliveryError::Closed.into(), None);
                break;
            }
            Err(err) => {
                errors.report(ErrorSource::Receive, err.into(), None);
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(receive_wait) => {}
                }
            }
        }
    }
    debug!(queue = %dispatch.queue, "pump stopped");
}

async fn worker_loop(
    worker_id: usize,
    dispatch: Arc<Dispatch>,
    rx: flume::Receiver<ReceivedMessage>,
    errors: ErrorSink,
    mut shutdown_rx: watch::Receiver<bool>,
    activity: Arc<ActivityGuard>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let message = tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = rx.recv_async() => match received {
                Ok(message) => message,
                // pump が終わり channel も空
                Err(_) => break,
            },
        };

        dispatch.invoke(worker_id, message, &errors, &activity).await;
    }
    debug!(worker_id, queue = %dispatch.queue, "worker stopped");
}
