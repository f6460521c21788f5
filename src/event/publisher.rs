use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::{sync::oneshot, task};

use super::emitter::{EmitterError, RunEmitter};
use super::event::RunEvent;
use super::sink::EventSink;

/// Per-run event publisher: receives events from the run's producers and
/// broadcasts them to the subscriber stream and any attached sinks.
///
/// One publisher exists per run. Producers hold cloned [`RunEmitter`]s;
/// a background listener task fans received events out to every sink in
/// arrival order, which gives the stream its total per-run ordering.
pub struct RunPublisher {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    event_channel: (flume::Sender<RunEvent>, flume::Receiver<RunEvent>),
    listener: Arc<Mutex<Option<ListenerState>>>,
    subscriber_connected: Arc<AtomicBool>,
}

impl RunPublisher {
    /// Open a publisher together with its single subscriber stream.
    ///
    /// `extra_sinks` are attached alongside the subscriber and observe the
    /// same ordered sequence of events.
    pub fn open(extra_sinks: Vec<Box<dyn EventSink>>) -> (Self, RunEventStream) {
        let (subscriber_tx, subscriber_rx) = mpsc::unbounded_channel();
        let subscriber_connected = Arc::new(AtomicBool::new(true));

        let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(SubscriberSink {
            tx: subscriber_tx,
            connected: subscriber_connected.clone(),
        })];
        sinks.extend(extra_sinks);

        let publisher = Self {
            sinks: Arc::new(Mutex::new(sinks)),
            event_channel: flume::unbounded(),
            listener: Arc::new(Mutex::new(None)),
            subscriber_connected,
        };
        publisher.listen_for_events();

        (publisher, RunEventStream {
            receiver: subscriber_rx,
        })
    }

    /// Get an emitter producers can clone to publish events.
    pub fn emitter(&self) -> RunEmitter {
        RunEmitter::new(self.event_channel.0.clone())
    }

    /// Publish an event onto the run's stream.
    pub fn publish(&self, event: RunEvent) -> Result<(), EmitterError> {
        self.event_channel
            .0
            .send(event)
            .map_err(|_| EmitterError::Closed)
    }

    /// Whether the subscriber end of the stream is still attached.
    ///
    /// Turns false once the consumer drops its [`RunEventStream`], letting
    /// the producer stop doing run-scoped work.
    pub fn subscriber_connected(&self) -> bool {
        self.subscriber_connected.load(Ordering::Relaxed)
    }

    /// Spawn a background task that listens for events and broadcasts to all
    /// sinks. Idempotent: calling multiple times has no effect.
    fn listen_for_events(&self) {
        let mut guard = self.listener.lock().expect("listener poisoned");
        if guard.is_some() {
            return;
        }

        let receiver = self.event_channel.1.clone();
        let sinks = self.sinks.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => dispatch(&sinks, &event),
                    }
                }
            }
            // Drain whatever was published before shutdown so terminal
            // events reach the subscriber.
            while let Ok(event) = receiver.try_recv() {
                dispatch(&sinks, &event);
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the listener after delivering all published events, then detach
    /// every sink so the subscriber stream ends.
    ///
    /// Idempotent: later calls are no-ops. After close, `publish` still
    /// accepts events but nothing consumes them.
    pub async fn close(&self) {
        let state = {
            let mut guard = self.listener.lock().expect("listener poisoned");
            guard.take()
        };
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
        self.sinks.lock().expect("sinks poisoned").clear();
    }
}

impl Drop for RunPublisher {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(state) = guard.take() {
                let _ = state.shutdown_tx.send(());
                state.handle.abort();
            }
        }
    }
}

fn dispatch(sinks: &Arc<Mutex<Vec<Box<dyn EventSink>>>>, event: &RunEvent) {
    let mut guard = sinks.lock().expect("sinks poisoned");
    for sink in guard.iter_mut() {
        if let Err(err) = sink.handle(event) {
            tracing::debug!(error = %err, "run publisher sink error");
        }
    }
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

/// Internal sink feeding the run's single subscriber.
struct SubscriberSink {
    tx: mpsc::UnboundedSender<RunEvent>,
    connected: Arc<AtomicBool>,
}

impl EventSink for SubscriberSink {
    fn handle(&mut self, event: &RunEvent) -> io::Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.tx.send(event.clone()).map_err(|_| {
            self.connected.store(false, Ordering::Relaxed);
            io::Error::new(io::ErrorKind::BrokenPipe, "subscriber dropped")
        })
    }
}

/// Consumer half of a run's event stream.
///
/// Events arrive in publication order and the stream ends after the run's
/// terminal event once the publisher closes.
#[derive(Debug)]
pub struct RunEventStream {
    receiver: mpsc::UnboundedReceiver<RunEvent>,
}

impl RunEventStream {
    /// Receive the next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<RunEvent, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with a deadline. `None` on timeout or end of stream.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<RunEvent> {
        match timeout(duration, self.receiver.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    pub fn into_async_stream(self) -> impl futures_util::stream::Stream<Item = RunEvent> {
        stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }

    pub fn into_blocking_iter(self) -> BlockingRunEventIter {
        BlockingRunEventIter {
            receiver: self.receiver,
        }
    }

    /// Collect every remaining event until the stream ends.
    pub async fn collect_remaining(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

pub struct BlockingRunEventIter {
    receiver: mpsc::UnboundedReceiver<RunEvent>,
}

impl Iterator for BlockingRunEventIter {
    type Item = RunEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.blocking_recv()
    }
}
