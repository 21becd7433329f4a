//! Timer-driven, single-current-item execution engine
//!
//! A [`Sequencer`] holds pending [`SequencerItem`]s in FIFO or LIFO order and
//! activates them one at a time. Each activation resolves the item's response
//! window: the item either executes immediately, after a one-shot timer, or
//! only when the owner asks for it explicitly.
//!
//! Timers run as tokio tasks. When one elapses it does not touch the
//! sequencer; it sends a [`TimerToken`] to the owner, which hands the token
//! back through [`Sequencer::handle_timer_elapsed`] from the same serialized
//! context that performs every other mutation. A token for an activation that
//! is no longer current, or whose item already began executing, is ignored.
//!
//! Lifecycle notifications are queued as [`SequencerEvent`]s and drained by the
//! single owner with [`Sequencer::poll_event`].

use log::{debug, error, warn};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static NEXT_SEQUENCER_ID: AtomicU32 = AtomicU32::new(1);

/// Outcome reported by [`SequencerItem::try_execute_effect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectResult {
    pub success: bool,
    pub message: Option<String>,
}

impl EffectResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// A unit of deferred work
///
/// Every method has a default so simple items only override what they need.
/// The sequencer guarantees `try_execute_effect` runs at most once per item.
pub trait SequencerItem: Send {
    /// Base response window, before the per-activation modifier is applied
    fn response_timeout(&self) -> Duration {
        Duration::ZERO
    }

    fn try_execute_effect(&mut self) -> EffectResult {
        EffectResult::ok()
    }

    fn on_became_current(&mut self) {}

    fn on_became_not_current(&mut self) {}
}

/// Order in which pending items are activated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceMode {
    /// First added, first activated
    #[default]
    Queue,
    /// Last added, first activated
    Stack,
}

/// Per-activation adjustment of an item's base response timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTimerMod {
    /// Execute as soon as the item becomes current
    Immediate,
    /// Add this many milliseconds (may be negative) to the base timeout
    Offset(i64),
    /// Never time out; the item waits for explicit completion
    Indefinite,
}

impl Default for ResponseTimerMod {
    fn default() -> Self {
        ResponseTimerMod::Offset(0)
    }
}

impl ResponseTimerMod {
    /// Combines the modifier with a base timeout.
    ///
    /// Offsets are applied in whole milliseconds and clamp at zero. A zero
    /// result is the same as `Immediate`.
    pub fn resolve(self, base: Duration) -> ResponseWindow {
        match self {
            ResponseTimerMod::Immediate => ResponseWindow::Immediate,
            ResponseTimerMod::Indefinite => ResponseWindow::Indefinite,
            ResponseTimerMod::Offset(offset_ms) => {
                let base_ms = i64::try_from(base.as_millis()).unwrap_or(i64::MAX);
                let total_ms = base_ms.saturating_add(offset_ms);
                if total_ms <= 0 {
                    ResponseWindow::Immediate
                } else {
                    ResponseWindow::Timed(Duration::from_millis(total_ms as u64))
                }
            }
        }
    }
}

/// Effective response window of the current item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseWindow {
    Immediate,
    Timed(Duration),
    Indefinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequencerId(u32);

impl fmt::Display for SequencerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one activation of one item; never reused within a sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationId(u64);

/// Sent by an elapsed response timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub sequencer: SequencerId,
    pub activation: ActivationId,
}

#[derive(Debug)]
pub enum SequencerEvent<I> {
    /// `previous` is the retired item, handed over so the owner can inspect it
    /// before it is dropped.
    CurrentItemChanged {
        previous: Option<I>,
        current: Option<ActivationId>,
    },
    ItemResponseTimerStarted {
        activation: ActivationId,
        timeout: Duration,
    },
    ItemExecuted {
        activation: ActivationId,
        success: bool,
        message: Option<String>,
    },
}

struct ActiveItem<I> {
    activation: ActivationId,
    item: I,
    window: ResponseWindow,
    response_deadline: Option<Instant>,
    has_begun_execution: bool,
}

struct ArmedTimer {
    token: TimerToken,
    task: JoinHandle<()>,
}

pub struct Sequencer<I: SequencerItem> {
    id: SequencerId,
    mode: SequenceMode,
    pending: VecDeque<(I, ResponseTimerMod)>,
    current: Option<ActiveItem<I>>,
    timer: Option<ArmedTimer>,
    timer_sink: Option<mpsc::UnboundedSender<TimerToken>>,
    last_activation: u64,
    events: VecDeque<SequencerEvent<I>>,
    disposed: bool,
}

impl<I: SequencerItem> Sequencer<I> {
    pub fn new(mode: SequenceMode) -> Self {
        Self {
            id: SequencerId(NEXT_SEQUENCER_ID.fetch_add(1, Ordering::Relaxed)),
            mode,
            pending: VecDeque::new(),
            current: None,
            timer: None,
            timer_sink: None,
            last_activation: 0,
            events: VecDeque::new(),
            disposed: false,
        }
    }

    /// Routes elapsed response timers to `sink`
    ///
    /// Without a sink, timed windows behave like `Indefinite`.
    pub fn with_timer_sink(mut self, sink: mpsc::UnboundedSender<TimerToken>) -> Self {
        self.set_timer_sink(sink);
        self
    }

    pub fn set_timer_sink(&mut self, sink: mpsc::UnboundedSender<TimerToken>) {
        self.timer_sink = Some(sink);
    }

    pub fn id(&self) -> SequencerId {
        self.id
    }

    pub fn mode(&self) -> SequenceMode {
        self.mode
    }

    /// Adds an item to the pending collection.
    ///
    /// `timer_mod` is only resolved once the item becomes current.
    pub fn add_item(&mut self, item: I, timer_mod: ResponseTimerMod) {
        if self.disposed {
            warn!("Sequencer {} is disposed, dropping added item", self.id);
            return;
        }
        self.pending.push_back((item, timer_mod));
    }

    /// Makes the next pending item current.
    ///
    /// Returns `None` when nothing is pending; the previous item is still
    /// retired in that case.
    pub fn activate_next_item(&mut self) -> Option<&I> {
        let next = match self.mode {
            SequenceMode::Queue => self.pending.pop_front(),
            SequenceMode::Stack => self.pending.pop_back(),
        };

        match next {
            Some(next) => {
                self.set_current(Some(next));
                self.current_item()
            }
            None => {
                if self.current.is_some() {
                    self.set_current(None);
                }
                None
            }
        }
    }

    /// Cancels the armed timer, retires the current item and drops all
    /// pending items.
    pub fn clear_sequence(&mut self) {
        self.cancel_timer();
        let dropped = self.pending.len();
        self.pending.clear();
        if self.current.is_some() {
            self.set_current(None);
        }
        if dropped > 0 {
            debug!("Sequencer {} cleared {} pending items", self.id, dropped);
        }
    }

    /// Executes the current item now if it has not begun executing.
    ///
    /// Any armed response timer is cancelled first. Returns true if this call
    /// performed the execution.
    pub fn execute_current(&mut self) -> bool {
        let Some(activation) = self.current_activation() else {
            return false;
        };
        self.cancel_timer();
        self.execute(activation)
    }

    /// Reacts to an elapsed response timer.
    ///
    /// Returns true if the token belonged to the armed timer and the current
    /// item executed because of it.
    pub fn handle_timer_elapsed(&mut self, token: TimerToken) -> bool {
        if token.sequencer != self.id {
            warn!(
                "Sequencer {} received timer token for sequencer {}",
                self.id, token.sequencer
            );
            return false;
        }

        match &self.timer {
            Some(armed) if armed.token == token => {
                self.timer = None;
            }
            _ => {
                debug!("Sequencer {} ignoring stale timer {:?}", self.id, token);
                return false;
            }
        }

        self.execute(token.activation)
    }

    /// Cancels the armed timer; later calls are no-ops
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.cancel_timer();
        self.disposed = true;
        debug!("Sequencer {} disposed", self.id);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn current_item(&self) -> Option<&I> {
        self.current.as_ref().map(|active| &active.item)
    }

    pub fn current_item_mut(&mut self) -> Option<&mut I> {
        self.current.as_mut().map(|active| &mut active.item)
    }

    pub fn current_activation(&self) -> Option<ActivationId> {
        self.current.as_ref().map(|active| active.activation)
    }

    pub fn current_response_window(&self) -> Option<ResponseWindow> {
        self.current.as_ref().map(|active| active.window)
    }

    /// Absolute deadline of the current response window; `None` if there is
    /// no current item or it waits indefinitely.
    pub fn current_response_deadline(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .and_then(|active| active.response_deadline)
    }

    pub fn has_begun_execution(&self) -> bool {
        self.current
            .as_ref()
            .map_or(false, |active| active.has_begun_execution)
    }

    /// Number of pending items, excluding the current one
    pub fn item_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_armed_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn poll_event(&mut self) -> Option<SequencerEvent<I>> {
        self.events.pop_front()
    }

    fn set_current(&mut self, next: Option<(I, ResponseTimerMod)>) {
        self.cancel_timer();

        let previous = self.current.take().map(|mut active| {
            active.item.on_became_not_current();
            active.item
        });

        let Some((mut item, timer_mod)) = next else {
            self.events.push_back(SequencerEvent::CurrentItemChanged {
                previous,
                current: None,
            });
            return;
        };

        item.on_became_current();

        self.last_activation += 1;
        let activation = ActivationId(self.last_activation);
        let window = timer_mod.resolve(item.response_timeout());
        let now = Instant::now();
        let response_deadline = match window {
            ResponseWindow::Immediate => Some(now),
            ResponseWindow::Timed(timeout) => Some(now + timeout),
            ResponseWindow::Indefinite => None,
        };

        self.current = Some(ActiveItem {
            activation,
            item,
            window,
            response_deadline,
            has_begun_execution: false,
        });
        self.events.push_back(SequencerEvent::CurrentItemChanged {
            previous,
            current: Some(activation),
        });

        match window {
            ResponseWindow::Immediate => {
                self.execute(activation);
            }
            ResponseWindow::Timed(timeout) => {
                if self.arm_timer(activation, now + timeout) {
                    self.events
                        .push_back(SequencerEvent::ItemResponseTimerStarted { activation, timeout });
                }
            }
            ResponseWindow::Indefinite => {
                debug!(
                    "Sequencer {} activation {:?} waits for explicit completion",
                    self.id, activation
                );
            }
        }
    }

    fn arm_timer(&mut self, activation: ActivationId, deadline: Instant) -> bool {
        self.cancel_timer();

        if self.disposed {
            return false;
        }

        let Some(sink) = self.timer_sink.clone() else {
            warn!(
                "Sequencer {} has no timer sink, activation {:?} waits for explicit completion",
                self.id, activation
            );
            return false;
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(
                    "Sequencer {} cannot arm timer outside a tokio runtime: {}",
                    self.id, e
                );
                return false;
            }
        };

        let token = TimerToken {
            sequencer: self.id,
            activation,
        };
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if sink.send(token).is_err() {
                debug!("Timer sink closed before {:?} was delivered", token);
            }
        });

        self.timer = Some(ArmedTimer { token, task });
        true
    }

    fn cancel_timer(&mut self) {
        if let Some(armed) = self.timer.take() {
            armed.task.abort();
        }
    }

    fn execute(&mut self, activation: ActivationId) -> bool {
        let Some(active) = self.current.as_mut() else {
            return false;
        };
        if active.activation != activation || active.has_begun_execution {
            return false;
        }
        active.has_begun_execution = true;

        let item = &mut active.item;
        let result = panic::catch_unwind(AssertUnwindSafe(|| item.try_execute_effect()))
            .unwrap_or_else(|cause| {
                let message = panic_message(cause.as_ref());
                error!("Sequencer item panicked while executing: {}", message);
                EffectResult::failed(message)
            });

        self.events.push_back(SequencerEvent::ItemExecuted {
            activation,
            success: result.success,
            message: result.message,
        });
        true
    }
}

impl<I: SequencerItem> Drop for Sequencer<I> {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "item effect panicked".to_string()
    }
}
