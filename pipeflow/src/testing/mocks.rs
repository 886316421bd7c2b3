//! Instrumented transforms and sinks for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::pipeline::Sink;
use crate::stages::{Transform, TransformKind};

/// An identity transform that records every item it sees.
#[derive(Debug)]
pub struct RecordingTransform<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Clone> Default for RecordingTransform<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> RecordingTransform<T> {
    /// Creates a new recording transform.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Returns the recorded items in call order.
    #[must_use]
    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.items.lock().len()
    }
}

#[async_trait]
impl<T> Transform<T, T> for RecordingTransform<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn apply(&self, item: T) -> anyhow::Result<Option<T>> {
        self.items.lock().push(item.clone());
        Ok(Some(item))
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Sync
    }
}

/// An identity transform that fails (or panics) on selected items.
pub struct FailingTransform<P> {
    predicate: P,
    message: String,
    panics: bool,
}

impl<P> FailingTransform<P> {
    /// Fails every item matching `predicate` with `message`.
    pub fn new(predicate: P, message: impl Into<String>) -> Self {
        Self {
            predicate,
            message: message.into(),
            panics: false,
        }
    }

    /// Panics on every item matching `predicate`.
    pub fn panicking(predicate: P, message: impl Into<String>) -> Self {
        Self {
            panics: true,
            ..Self::new(predicate, message)
        }
    }
}

impl<P> Debug for FailingTransform<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingTransform")
            .field("message", &self.message)
            .field("panics", &self.panics)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, P> Transform<T, T> for FailingTransform<P>
where
    T: Debug + Send + 'static,
    P: Fn(&T) -> bool + Send + Sync,
{
    async fn apply(&self, item: T) -> anyhow::Result<Option<T>> {
        if (self.predicate)(&item) {
            if self.panics {
                panic!("{}: {item:?}", self.message);
            }
            anyhow::bail!("{}: {item:?}", self.message);
        }
        Ok(Some(item))
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Sync
    }
}

/// An identity transform that sleeps before passing each item on and
/// tracks how many calls overlap.
#[derive(Debug)]
pub struct SlowTransform {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SlowTransform {
    /// Creates a new slow transform.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a slow transform with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Returns the largest number of calls that ran at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Returns the number of completed calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> Transform<T, T> for SlowTransform {
    async fn apply(&self, item: T) -> anyhow::Result<Option<T>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(item))
    }
}

/// Controls how many items a [`GatedSink`] may consume.
#[derive(Debug, Clone)]
pub struct SinkGate {
    permits: Arc<Semaphore>,
    opened: Arc<AtomicBool>,
    consumed: Arc<AtomicUsize>,
}

impl SinkGate {
    /// Lets `n` more items through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Lets every remaining item through.
    pub fn open(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.permits.add_permits(Semaphore::MAX_PERMITS >> 1);
        }
    }

    /// Returns the number of items consumed so far.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }
}

/// A collecting sink that waits for a [`SinkGate`] permit before each item.
///
/// Holding the gate shut makes every upstream queue fill to capacity.
#[derive(Debug)]
pub struct GatedSink<T> {
    gate: SinkGate,
    items: Vec<T>,
}

impl<T> GatedSink<T> {
    /// Creates a closed sink and the gate controlling it.
    #[must_use]
    pub fn closed() -> (Self, SinkGate) {
        let gate = SinkGate {
            permits: Arc::new(Semaphore::new(0)),
            opened: Arc::new(AtomicBool::new(false)),
            consumed: Arc::new(AtomicUsize::new(0)),
        };
        (
            Self {
                gate: gate.clone(),
                items: Vec::new(),
            },
            gate,
        )
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for GatedSink<T> {
    type Output = Vec<T>;

    async fn consume(&mut self, item: T) -> anyhow::Result<()> {
        self.gate.permits.acquire().await?.forget();
        self.items.push(item);
        self.gate.consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<Vec<T>> {
        Ok(std::mem::take(&mut self.items))
    }
}
