use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use tether_types::{now_ms, EventPayload, RunEvent, RunOutcome, StreamItem, TerminalMarker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run buffer is closed")]
pub struct BufferClosed;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The receiving side is gone; the buffer detaches the listener.
    #[error("listener channel closed")]
    Closed,
    #[error("listener rejected delivery: {0}")]
    Rejected(String),
}

/// Receives a run's stream items.
///
/// Delivery is best-effort: the buffer calls `deliver` while holding its lock
/// and ignores any error, so implementations must not block and must not call
/// back into the same buffer.
pub trait RunListener: Send + Sync {
    fn deliver(&self, item: &StreamItem) -> Result<(), DeliveryError>;
}

impl<F> RunListener for F
where
    F: Fn(&StreamItem) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, item: &StreamItem) -> Result<(), DeliveryError> {
        self(item)
    }
}

/// Forwards items into an unbounded channel, the usual bridge to an async consumer.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<StreamItem>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<StreamItem>) -> Self {
        Self { tx }
    }

    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }
}

impl RunListener for ChannelListener {
    fn deliver(&self, item: &StreamItem) -> Result<(), DeliveryError> {
        self.tx
            .send(item.clone())
            .map_err(|_| DeliveryError::Closed)
    }
}

struct AttachedListener {
    id: u64,
    listener: Arc<dyn RunListener>,
}

#[derive(Default)]
struct BufferState {
    events: Vec<RunEvent>,
    last_seq: u64,
    listeners: Vec<AttachedListener>,
    next_listener_id: u64,
    terminal: Option<TerminalMarker>,
}

impl BufferState {
    fn broadcast(&mut self, item: &StreamItem) {
        self.listeners
            .retain(|attached| match attached.listener.deliver(item) {
                Ok(()) => true,
                Err(DeliveryError::Closed) => {
                    tracing::debug!(listener = attached.id, "detaching closed listener");
                    false
                }
                Err(err) => {
                    tracing::debug!(listener = attached.id, error = %err, "delivery dropped");
                    true
                }
            });
    }
}

/// Append-only event log for one run plus its attached listeners.
///
/// Every append and every replay happens under one lock, which is what gives
/// each listener the exact append order with no gap between replayed history
/// and live delivery.
#[derive(Clone, Default)]
pub struct EventBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that is already frozen, used when a finished run is rebuilt
    /// without its history.
    pub fn closed(outcome: RunOutcome) -> Self {
        let buffer = Self::new();
        let _ = buffer.close(outcome);
        buffer
    }

    pub fn append(&self, payload: EventPayload) -> Result<RunEvent, BufferClosed> {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return Err(BufferClosed);
        }
        state.last_seq += 1;
        let event = RunEvent {
            seq: state.last_seq,
            timestamp_ms: now_ms(),
            payload,
        };
        state.events.push(event.clone());
        state.broadcast(&StreamItem::Event(event.clone()));
        Ok(event)
    }

    /// Appends the terminal marker, delivers it to every listener and detaches them.
    pub fn close(&self, outcome: RunOutcome) -> Result<TerminalMarker, BufferClosed> {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return Err(BufferClosed);
        }
        state.last_seq += 1;
        let marker = TerminalMarker {
            seq: state.last_seq,
            timestamp_ms: now_ms(),
            outcome,
        };
        state.terminal = Some(marker.clone());
        state.broadcast(&StreamItem::Terminal(marker.clone()));
        state.listeners.clear();
        Ok(marker)
    }

    /// Attaches `listener`.
    ///
    /// With `replay` the full history is delivered before this returns. On a
    /// closed buffer nothing is attached: replay yields the history followed by
    /// the terminal marker, and a non-replay subscriber only gets the marker.
    pub fn subscribe(&self, listener: Arc<dyn RunListener>, replay: bool) -> Subscription {
        let mut state = self.state.lock();
        if replay {
            for event in &state.events {
                let _ = listener.deliver(&StreamItem::Event(event.clone()));
            }
        }
        if let Some(marker) = state.terminal.as_ref() {
            let _ = listener.deliver(&StreamItem::Terminal(marker.clone()));
            return Subscription::detached();
        }
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.listeners.push(AttachedListener { id, listener });
        Subscription {
            id,
            state: Arc::downgrade(&self.state),
            active: AtomicBool::new(true),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    pub fn terminal(&self) -> Option<TerminalMarker> {
        self.state.lock().terminal.clone()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.state.lock().terminal.as_ref().map(|m| m.outcome.clone())
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn snapshot(&self) -> Vec<RunEvent> {
        self.state.lock().events.clone()
    }
}

/// Handle returned by [`EventBuffer::subscribe`]. Dropping it does not detach
/// the listener; a listener whose channel closes is detached on the next delivery.
pub struct Subscription {
    id: u64,
    state: Weak<Mutex<BufferState>>,
    active: AtomicBool,
}

impl Subscription {
    fn detached() -> Self {
        Self {
            id: 0,
            state: Weak::new(),
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        self.state
            .upgrade()
            .map(|state| state.lock().listeners.iter().any(|l| l.id == self.id))
            .unwrap_or(false)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            state.lock().listeners.retain(|l| l.id != self.id);
        }
    }
}
