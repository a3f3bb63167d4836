//! End-to-end scenarios: sender -> in-memory transport -> processor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use relay_core::{
    BatchLimits, ErrorHandler, ErrorSource, FixedClock, HandlerError, InMemoryTransport,
    LoggingErrorHandler, MessageHandler, ProcessErrorContext, ProcessMessageContext, Processor,
    ProcessorOptions, QueueCounts, QueueOptions, RelayClient, RelayConfig, Transport,
};

const QUEUE: &str = "MYQUEUE20240522194000";
const RECEIVE_WAIT: Duration = Duration::from_millis(20);

fn options(max_concurrent_calls: usize) -> ProcessorOptions {
    ProcessorOptions {
        max_concurrent_calls,
        receive_wait: RECEIVE_WAIT,
        ..ProcessorOptions::default()
    }
}

async fn simulated(queue: QueueOptions) -> (Arc<FixedClock>, Arc<InMemoryTransport>, RelayClient) {
    let start = Utc.with_ymd_and_hms(2024, 5, 22, 19, 40, 0).unwrap();
    let clock = Arc::new(FixedClock::new(start));
    let transport = Arc::new(InMemoryTransport::new(clock.clone(), BatchLimits::default()));
    transport.create_queue(QUEUE, queue).await;
    let client = RelayClient::with_transport("memory://sim", transport.clone());
    (clock, transport, client)
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn counts_reach(
    transport: &InMemoryTransport,
    what: &str,
    cond: impl Fn(QueueCounts) -> bool,
) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond(transport.counts(QUEUE).await.unwrap()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<(String, u32)>>>);

impl Log {
    fn push(&self, body: String, delivery_count: u32) {
        self.0.lock().unwrap().push((body, delivery_count));
    }

    fn entries(&self) -> Vec<(String, u32)> {
        self.0.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Completes everything it receives.
#[derive(Clone, Default)]
struct Completing(Log);

#[async_trait]
impl MessageHandler for Completing {
    async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError> {
        let message = ctx.message();
        self.0
            .push(message.body_text().into_owned(), message.delivery_count());
        ctx.complete(message).await?;
        Ok(())
    }
}

/// Fails the first delivery of every message, completes later ones.
#[derive(Clone, Default)]
struct FailFirst(Log);

#[async_trait]
impl MessageHandler for FailFirst {
    async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError> {
        let message = ctx.message();
        self.0
            .push(message.body_text().into_owned(), message.delivery_count());
        if message.delivery_count() == 1 {
            return Err(HandlerError::msg("downstream unavailable"));
        }
        ctx.complete(message).await?;
        Ok(())
    }
}

/// Never succeeds.
#[derive(Clone, Default)]
struct AlwaysFail(Log);

#[async_trait]
impl MessageHandler for AlwaysFail {
    async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError> {
        let message = ctx.message();
        self.0
            .push(message.body_text().into_owned(), message.delivery_count());
        Err(HandlerError::msg("rejected"))
    }
}

#[derive(Clone, Default)]
struct Errors(Arc<Mutex<Vec<ErrorSource>>>);

impl Errors {
    fn count(&self, source: ErrorSource) -> usize {
        self.0.lock().unwrap().iter().filter(|s| **s == source).count()
    }
}

#[async_trait]
impl ErrorHandler for Errors {
    async fn on_error(&self, ctx: &ProcessErrorContext) {
        self.0.lock().unwrap().push(ctx.source);
    }
}

fn processor(
    client: &RelayClient,
    options: ProcessorOptions,
    handler: impl MessageHandler + 'static,
    errors: impl ErrorHandler + 'static,
) -> Processor {
    client
        .create_processor(QUEUE)
        .options(options)
        .on_message(handler)
        .on_error(errors)
        .build()
        .unwrap()
}

#[tokio::test]
async fn four_messages_round_trip() {
    let mut config = RelayConfig::default();
    config.connection.queue = QUEUE.to_string();
    let client = RelayClient::connect(&config).await.unwrap();
    let sender = client.create_sender(QUEUE);

    let mut batch = sender.create_batch();
    for i in 0..4 {
        assert!(batch.try_add(i.to_string()));
    }
    sender.send_batch(batch).await.unwrap();

    let handler = Completing::default();
    let mut processor = processor(&client, options(1), handler.clone(), LoggingErrorHandler);
    processor.start().await.unwrap();
    eventually("four deliveries", || handler.0.len() == 4).await;
    processor.stop().await;

    let bodies: Vec<String> = handler.0.entries().into_iter().map(|(b, _)| b).collect();
    assert_eq!(bodies, vec!["0", "1", "2", "3"]);

    let counts = client.queue_counts(QUEUE).await.unwrap();
    assert_eq!(counts.acknowledged, 4);
    assert_eq!(counts.depth(), 0);

    processor.dispose().await;
    client.dispose().await.unwrap();
}

#[tokio::test]
async fn overflowing_batch_sends_only_what_fit() {
    let transport = Arc::new(InMemoryTransport::new(
        Arc::new(relay_core::SystemClock),
        BatchLimits::new(100, 2),
    ));
    transport.create_queue(QUEUE, QueueOptions::default()).await;
    let client = RelayClient::with_transport("memory://small", transport.clone());
    let sender = client.create_sender(QUEUE);

    let mut batch = sender.create_batch();
    assert!(batch.try_add("0"));
    assert!(batch.try_add("1"));
    assert!(!batch.try_add("2"));
    assert_eq!(batch.len(), 2);

    sender.send_batch(batch).await.unwrap();
    assert_eq!(transport.counts(QUEUE).await.unwrap().pending, 2);
}

#[tokio::test]
async fn failed_handler_message_reappears_after_visibility_timeout() {
    let (clock, transport, client) = simulated(QueueOptions {
        visibility_timeout: Duration::from_secs(30),
        max_delivery_count: Some(5),
    })
    .await;
    client.create_sender(QUEUE).send_message("retry-me").await.unwrap();

    let handler = FailFirst::default();
    let errors = Errors::default();
    let mut processor = processor(&client, options(1), handler.clone(), errors.clone());
    processor.start().await.unwrap();

    eventually("first failure", || errors.count(ErrorSource::UserCallback) == 1).await;

    // まだ lease 中なので再配送されない
    tokio::time::sleep(RECEIVE_WAIT * 3).await;
    let counts = transport.counts(QUEUE).await.unwrap();
    assert_eq!((counts.pending, counts.in_flight), (0, 1));
    assert_eq!(handler.0.len(), 1);

    clock.advance(Duration::from_secs(31));
    counts_reach(&transport, "redelivery", |c| c.acknowledged == 1).await;
    processor.stop().await;

    assert_eq!(
        handler.0.entries(),
        vec![("retry-me".to_string(), 1), ("retry-me".to_string(), 2)]
    );
}

#[tokio::test]
async fn receive_errors_go_to_error_handler_and_delivery_continues() {
    let (_clock, transport, client) = simulated(QueueOptions::default()).await;
    transport.inject_receive_failures(3).await;

    let sender = client.create_sender(QUEUE);
    let mut batch = sender.create_batch();
    assert!(batch.try_add("a"));
    assert!(batch.try_add("b"));
    sender.send_batch(batch).await.unwrap();

    let handler = Completing::default();
    let errors = Errors::default();
    let mut processor = processor(&client, options(1), handler.clone(), errors.clone());
    processor.start().await.unwrap();

    eventually("both messages", || handler.0.len() == 2).await;
    processor.stop().await;

    assert_eq!(errors.count(ErrorSource::Receive), 3);
    assert_eq!(transport.counts(QUEUE).await.unwrap().acknowledged, 2);
}

#[tokio::test]
async fn nothing_is_dispatched_after_stop() {
    let (_clock, transport, client) = simulated(QueueOptions::default()).await;
    let handler = Completing::default();
    let mut processor = processor(&client, options(2), handler.clone(), LoggingErrorHandler);

    processor.start().await.unwrap();
    processor.stop().await;

    let sender = client.create_sender(QUEUE);
    let mut batch = sender.create_batch();
    for i in 0..3 {
        assert!(batch.try_add(i.to_string()));
    }
    sender.send_batch(batch).await.unwrap();

    tokio::time::sleep(RECEIVE_WAIT * 5).await;
    assert_eq!(handler.0.len(), 0);
    assert_eq!(transport.counts(QUEUE).await.unwrap().pending, 3);
}

#[tokio::test]
async fn exhausted_message_is_dead_lettered() {
    let (clock, transport, client) = simulated(QueueOptions {
        visibility_timeout: Duration::from_secs(10),
        max_delivery_count: Some(2),
    })
    .await;
    client.create_sender(QUEUE).send_message("poison").await.unwrap();

    let handler = AlwaysFail::default();
    let mut processor = processor(&client, options(1), handler.clone(), LoggingErrorHandler);
    processor.start().await.unwrap();

    eventually("first delivery", || handler.0.len() == 1).await;
    clock.advance(Duration::from_secs(11));
    eventually("second delivery", || handler.0.len() == 2).await;
    clock.advance(Duration::from_secs(11));
    counts_reach(&transport, "dead letter", |c| c.dead_lettered == 1).await;
    processor.stop().await;

    let dead = transport.dead_letters(QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].delivery_count, 2);
    assert_eq!(dead[0].reason, "lease expired");
    assert_eq!(transport.counts(QUEUE).await.unwrap().depth(), 0);
}

#[tokio::test]
async fn prefetched_messages_are_released_on_stop() {
    let (_clock, transport, client) = simulated(QueueOptions::default()).await;

    /// Holds the worker until released.
    struct Gate(Arc<tokio::sync::Notify>, Log);

    #[async_trait]
    impl MessageHandler for Gate {
        async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError> {
            let message = ctx.message();
            self.1
                .push(message.body_text().into_owned(), message.delivery_count());
            self.0.notified().await;
            ctx.complete(message).await?;
            Ok(())
        }
    }

    let sender = client.create_sender(QUEUE);
    let mut batch = sender.create_batch();
    for i in 0..4 {
        assert!(batch.try_add(i.to_string()));
    }
    sender.send_batch(batch).await.unwrap();

    let gate = Arc::new(tokio::sync::Notify::new());
    let log = Log::default();
    let mut processor = processor(
        &client,
        ProcessorOptions {
            prefetch: Some(2),
            ..options(1)
        },
        Gate(gate.clone(), log.clone()),
        LoggingErrorHandler,
    );
    processor.start().await.unwrap();

    // worker 1 本が "0" で止まり、channel に 2 通、pump が 1 通を抱える
    counts_reach(&transport, "prefetch filled", |c| c.in_flight == 4).await;

    let stopping = tokio::spawn(async move {
        processor.stop().await;
        processor
    });
    tokio::time::sleep(RECEIVE_WAIT).await;
    gate.notify_one();
    let _processor = stopping.await.unwrap();

    assert_eq!(log.len(), 1);
    let counts = transport.counts(QUEUE).await.unwrap();
    assert_eq!(counts.acknowledged, 1);
    assert_eq!((counts.pending, counts.in_flight), (3, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handlers_run_concurrently_up_to_the_limit() {
    let (_clock, transport, client) = simulated(QueueOptions::default()).await;

    #[derive(Clone, Default)]
    struct Tracking {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for Tracking {
        async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            ctx.complete(ctx.message()).await?;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let sender = client.create_sender(QUEUE);
    let mut batch = sender.create_batch();
    for i in 0..8 {
        assert!(batch.try_add(i.to_string()));
    }
    sender.send_batch(batch).await.unwrap();

    let tracking = Tracking::default();
    let mut processor = processor(&client, options(3), tracking.clone(), LoggingErrorHandler);
    processor.start().await.unwrap();
    eventually("all handled", || tracking.done.load(Ordering::SeqCst) == 8).await;
    processor.stop().await;

    let peak = tracking.peak.load(Ordering::SeqCst);
    assert!(peak > 1, "handlers never overlapped");
    assert!(peak <= 3, "peak concurrency {peak} exceeded the limit");
    assert_eq!(transport.counts(QUEUE).await.unwrap().acknowledged, 8);
}

#[tokio::test]
async fn client_refuses_dispose_while_processor_runs() {
    let (_clock, _transport, client) = simulated(QueueOptions::default()).await;
    let mut processor = processor(&client, options(1), Completing::default(), LoggingErrorHandler);
    processor.start().await.unwrap();

    let err = client.clone().dispose().await.unwrap_err();
    assert!(matches!(err, relay_core::ClientError::ProcessorsActive(1)));

    processor.stop().await;
    client.dispose().await.unwrap();
}

#[tokio::test]
async fn dropped_processor_keeps_client_open_until_handler_returns() {
    let (_clock, transport, client) = simulated(QueueOptions::default()).await;

    /// Waits for the gate, then records whether `complete` went through.
    struct Gated {
        gate: Arc<tokio::sync::Notify>,
        started: Arc<AtomicUsize>,
        completed: Arc<Mutex<Option<bool>>>,
    }

    #[async_trait]
    impl MessageHandler for Gated {
        async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            let settled = ctx.complete(ctx.message()).await;
            *self.completed.lock().unwrap() = Some(settled.is_ok());
            Ok(())
        }
    }

    client.create_sender(QUEUE).send_message("slow").await.unwrap();

    let gate = Arc::new(tokio::sync::Notify::new());
    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(Mutex::new(None));
    let handler = Gated {
        gate: gate.clone(),
        started: started.clone(),
        completed: completed.clone(),
    };
    let mut processor = processor(&client, options(1), handler, LoggingErrorHandler);
    processor.start().await.unwrap();
    eventually("handler started", || started.load(Ordering::SeqCst) == 1).await;

    // stop せずに捨てる。handler はまだ gate で待っている
    drop(processor);
    let err = client.clone().dispose().await.unwrap_err();
    assert!(matches!(err, relay_core::ClientError::ProcessorsActive(1)));
    assert!(!client.is_closed());

    gate.notify_one();
    let disposed = tokio::time::timeout(Duration::from_secs(5), async {
        while client.clone().dispose().await.is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(disposed.is_ok(), "timed out waiting for dispose");

    assert_eq!(*completed.lock().unwrap(), Some(true));
    assert!(client.is_closed());
    assert!(transport.counts(QUEUE).await.is_err());
}

#[tokio::test]
async fn panicking_error_handler_does_not_stop_processing() {
    let (_clock, transport, client) = simulated(QueueOptions::default()).await;
    transport.inject_receive_failures(2).await;

    #[derive(Clone, Default)]
    struct Exploding(Arc<AtomicUsize>);

    #[async_trait]
    impl ErrorHandler for Exploding {
        async fn on_error(&self, _ctx: &ProcessErrorContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("error handler blew up");
        }
    }

    let sender = client.create_sender(QUEUE);
    let mut batch = sender.create_batch();
    for i in 0..3 {
        assert!(batch.try_add(i.to_string()));
    }
    sender.send_batch(batch).await.unwrap();

    let handler = Completing::default();
    let errors = Exploding::default();
    let mut processor = processor(&client, options(1), handler.clone(), errors.clone());
    processor.start().await.unwrap();

    eventually("three deliveries", || handler.0.len() == 3).await;
    eventually("both receive errors reported", || {
        errors.0.load(Ordering::SeqCst) == 2
    })
    .await;
    counts_reach(&transport, "all acknowledged", |c| c.acknowledged == 3).await;
    assert_eq!(processor.state(), relay_core::ProcessorState::Running);

    processor.stop().await;
    assert_eq!(processor.state(), relay_core::ProcessorState::Stopped);
    client.dispose().await.unwrap();
}
