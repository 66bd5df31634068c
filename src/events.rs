//! Synchronous publish/subscribe event bus
//!
//! The bus decouples the engine (navigation, task runner, context logging)
//! from whatever presents it. Handlers run synchronously on the publishing
//! thread, in subscription order. The subscriber list is snapshotted before
//! dispatch, so a handler may subscribe, unsubscribe or publish without
//! deadlocking the bus.
//!
//! For presentation layers that live on their own thread, `channel()`
//! forwards every event into an mpsc receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, RwLock};
use strum::{Display, EnumIter, EnumString};

use crate::context::LogLevel;
use crate::sync::{read, write};

/// Event kinds used for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    Progress,
    Log,
    StepChange,
    TaskStart,
    TaskComplete,
    TaskError,
    TaskRolledBack,
    FlowComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressPayload {
    pub task_id: String,
    /// Fraction in `[0.0, 1.0]`
    pub progress: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepChangePayload {
    pub from_step: String,
    pub to_step: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    pub task_id: String,
    pub task_type: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowCompletePayload {
    pub flow_id: String,
}

/// An event published on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Progress(ProgressPayload),
    Log(LogPayload),
    StepChange(StepChangePayload),
    TaskStart(TaskPayload),
    TaskComplete(TaskPayload),
    TaskError(TaskPayload),
    TaskRolledBack(TaskPayload),
    FlowComplete(FlowCompletePayload),
}

impl Event {
    /// The kind of this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Progress(_) => EventType::Progress,
            Event::Log(_) => EventType::Log,
            Event::StepChange(_) => EventType::StepChange,
            Event::TaskStart(_) => EventType::TaskStart,
            Event::TaskComplete(_) => EventType::TaskComplete,
            Event::TaskError(_) => EventType::TaskError,
            Event::TaskRolledBack(_) => EventType::TaskRolledBack,
            Event::FlowComplete(_) => EventType::FlowComplete,
        }
    }

    pub fn progress_payload(&self) -> Option<&ProgressPayload> {
        match self {
            Event::Progress(p) => Some(p),
            _ => None,
        }
    }

    pub fn log_payload(&self) -> Option<&LogPayload> {
        match self {
            Event::Log(p) => Some(p),
            _ => None,
        }
    }

    pub fn step_change_payload(&self) -> Option<&StepChangePayload> {
        match self {
            Event::StepChange(p) => Some(p),
            _ => None,
        }
    }

    /// Payload of any task lifecycle event
    pub fn task_payload(&self) -> Option<&TaskPayload> {
        match self {
            Event::TaskStart(p)
            | Event::TaskComplete(p)
            | Event::TaskError(p)
            | Event::TaskRolledBack(p) => Some(p),
            _ => None,
        }
    }

    pub fn flow_complete_payload(&self) -> Option<&FlowCompletePayload> {
        match self {
            Event::FlowComplete(p) => Some(p),
            _ => None,
        }
    }
}

/// Event handler callback
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token returned by `subscribe*`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    /// `None` receives every event type
    filter: Option<EventType>,
    handler: Handler,
}

/// Thread-safe synchronous event bus
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a single event type
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(Some(event_type), Arc::new(handler))
    }

    /// Register a handler for every event type
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Forward every event into a channel. The sender is dropped by
    /// `clear()` or when the bus itself is dropped, ending the receiver.
    pub fn channel(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        self.subscribe_all(move |event| {
            // A dropped receiver just means nobody is watching anymore
            let _ = crate::sync::lock(&tx).send(event.clone());
        });
        rx
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = write(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Remove every subscription
    pub fn clear(&self) {
        write(&self.subscribers).clear();
    }

    pub fn subscriber_count(&self) -> usize {
        read(&self.subscribers).len()
    }

    /// Deliver an event to every matching handler, in subscription order
    pub fn publish(&self, event: Event) {
        let event_type = event.event_type();
        let handlers: Vec<Handler> = read(&self.subscribers)
            .iter()
            .filter(|s| s.filter.is_none_or(|t| t == event_type))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(&event);
        }
    }

    fn add(&self, filter: Option<EventType>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write(&self.subscribers).push(Subscriber {
            id,
            filter,
            handler,
        });
        id
    }

    // ------------------------------------------------------------------
    // Convenience publishers
    // ------------------------------------------------------------------

    pub fn publish_progress(&self, task_id: &str, progress: f64, message: &str) {
        self.publish(Event::Progress(ProgressPayload {
            task_id: task_id.to_string(),
            progress: progress.clamp(0.0, 1.0),
            message: message.to_string(),
        }));
    }

    pub fn publish_log(&self, level: LogLevel, message: &str) {
        self.publish(Event::Log(LogPayload {
            level,
            message: message.to_string(),
        }));
    }

    pub fn publish_step_change(&self, from_step: &str, to_step: &str) {
        self.publish(Event::StepChange(StepChangePayload {
            from_step: from_step.to_string(),
            to_step: to_step.to_string(),
        }));
    }

    pub fn publish_task_start(&self, task_id: &str, task_type: &str) {
        self.publish(Event::TaskStart(task_payload(task_id, task_type, None)));
    }

    pub fn publish_task_complete(&self, task_id: &str, task_type: &str) {
        self.publish(Event::TaskComplete(task_payload(task_id, task_type, None)));
    }

    pub fn publish_task_error(&self, task_id: &str, task_type: &str, error: &str) {
        self.publish(Event::TaskError(task_payload(
            task_id,
            task_type,
            Some(error.to_string()),
        )));
    }

    pub fn publish_task_rolled_back(&self, task_id: &str, task_type: &str) {
        self.publish(Event::TaskRolledBack(task_payload(task_id, task_type, None)));
    }

    pub fn publish_flow_complete(&self, flow_id: &str) {
        self.publish(Event::FlowComplete(FlowCompletePayload {
            flow_id: flow_id.to_string(),
        }));
    }
}

fn task_payload(task_id: &str, task_type: &str, error: Option<String>) -> TaskPayload {
    TaskPayload {
        task_id: task_id.to_string(),
        task_type: task_type.to_string(),
        error,
    }
}
