//! Declarative saga definitions.
//!
//! A definition binds event types to transitions, per state. A transition
//! can correlate the event to an instance, copy event fields onto the
//! instance data, run an async action, register a named compensation,
//! publish follow-up messages, request a timeout event, branch on a
//! predicate, and move the instance to another state. Compensation
//! closures are defined once on the definition and referenced by name from
//! the instance's compensation log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use super::SagaStepError;
use crate::error::ProcessingError;
use crate::message::Message;

/// State tag of an instance that has not consumed its first event yet.
pub const INITIAL_STATE: &str = "(initial)";

pub type CorrelationFn = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;
pub type MutationFn = Arc<dyn Fn(&mut serde_json::Value, &Message) + Send + Sync>;
pub type GuardFn = Arc<dyn Fn(&serde_json::Value, &Message) -> bool + Send + Sync>;
pub type ActionFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, std::result::Result<(), SagaStepError>> + Send + Sync>;
pub type CompensationFn = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<(), ProcessingError>>
        + Send
        + Sync,
>;
pub type PublishFn = Arc<dyn Fn(&serde_json::Value, &Message) -> Option<Message> + Send + Sync>;
pub type TimeoutEventFn = Arc<dyn Fn(&serde_json::Value) -> Message + Send + Sync>;

/// Where a transition leaves the instance.
#[derive(Clone)]
pub enum TransitionTarget {
    /// Keep the current state.
    Stay,
    /// Move to a named state.
    To(String),
    /// Move to a named terminal state; the instance accepts no further
    /// events.
    Complete(String),
    /// Pick a target by predicate over (instance data, event).
    Branch {
        predicate: GuardFn,
        if_true: Box<TransitionTarget>,
        if_false: Box<TransitionTarget>,
    },
}

/// Effects an action may emit besides mutating its own world.
#[derive(Clone, Default)]
pub struct StepEffects {
    publishes: Arc<Mutex<Vec<Message>>>,
}

impl StepEffects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for dispatch after the step commits.
    pub fn publish(&self, message: Message) {
        self.publishes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    pub(crate) fn take_publishes(&self) -> Vec<Message> {
        std::mem::take(&mut *self.publishes.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// What an action sees: a snapshot of the instance data (mutations already
/// applied), the triggering event, and the effects sink.
#[derive(Clone)]
pub struct StepContext {
    pub data: serde_json::Value,
    pub message: Arc<Message>,
    pub effects: StepEffects,
}

/// One event binding inside a definition.
pub struct TransitionSpec {
    pub(crate) event_type: String,
    /// `None` binds the event in the before-initial state.
    pub(crate) from_state: Option<String>,
    pub(crate) correlate: Option<CorrelationFn>,
    pub(crate) guard: Option<GuardFn>,
    pub(crate) mutations: Vec<MutationFn>,
    pub(crate) action: Option<ActionFn>,
    /// Compensation registered when the action (or bare transition)
    /// succeeds.
    pub(crate) compensation: Option<String>,
    pub(crate) publishes: Vec<PublishFn>,
    pub(crate) timeout: Option<(Duration, TimeoutEventFn)>,
    pub(crate) target: TransitionTarget,
}

impl TransitionSpec {
    fn new(event_type: String, from_state: Option<String>) -> Self {
        Self {
            event_type,
            from_state,
            correlate: None,
            guard: None,
            mutations: Vec::new(),
            action: None,
            compensation: None,
            publishes: Vec::new(),
            timeout: None,
            target: TransitionTarget::Stay,
        }
    }

    /// Derive the correlation id from the event. Without this the
    /// envelope's correlation id is used.
    pub fn correlate<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        self.correlate = Some(Arc::new(f));
        self
    }

    /// Shorthand: correlate by a string field of the payload.
    pub fn correlate_on(&mut self, field: &str) -> &mut Self {
        let field = field.to_string();
        self.correlate(move |message| {
            message
                .payload
                .get(&field)
                .and_then(|value| value.as_str())
                .map(str::to_string)
        })
    }

    /// Consume the event only when the predicate holds; otherwise it is
    /// ignored for this instance.
    pub fn guard<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&serde_json::Value, &Message) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(f));
        self
    }

    /// Mutate the instance data from the event.
    pub fn mutate<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut serde_json::Value, &Message) + Send + Sync + 'static,
    {
        self.mutations.push(Arc::new(f));
        self
    }

    /// Shorthand: copy a payload field onto the instance data under the
    /// same key.
    pub fn copy_field(&mut self, field: &str) -> &mut Self {
        let field = field.to_string();
        self.mutate(move |data, message| {
            if let Some(value) = message.payload.get(&field) {
                data[&field] = value.clone();
            }
        })
    }

    /// Async action run when the transition fires.
    pub fn action<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(StepContext) -> BoxFuture<'static, std::result::Result<(), SagaStepError>>
            + Send
            + Sync
            + 'static,
    {
        self.action = Some(Arc::new(f));
        self
    }

    /// Register the named compensation when this transition succeeds. The
    /// closure is defined once via [`SagaDefinition::define_compensation`].
    pub fn register_compensation(&mut self, name: &str) -> &mut Self {
        self.compensation = Some(name.to_string());
        self
    }

    /// Publish a follow-up message after the step commits.
    pub fn publish<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&serde_json::Value, &Message) -> Option<Message> + Send + Sync + 'static,
    {
        self.publishes.push(Arc::new(f));
        self
    }

    /// Request a self-addressed timeout event, delivered via the scheduler
    /// unless a later transition fires first.
    pub fn request_timeout<F>(&mut self, after: Duration, f: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Message + Send + Sync + 'static,
    {
        self.timeout = Some((after, Arc::new(f)));
        self
    }

    /// Move to a named state.
    pub fn then_transition(&mut self, state: &str) -> &mut Self {
        self.target = TransitionTarget::To(state.to_string());
        self
    }

    /// Move to a named terminal state.
    pub fn then_complete(&mut self, state: &str) -> &mut Self {
        self.target = TransitionTarget::Complete(state.to_string());
        self
    }

    /// Branch between two states on a predicate.
    pub fn branch<F>(&mut self, predicate: F, if_true: &str, if_false: &str) -> &mut Self
    where
        F: Fn(&serde_json::Value, &Message) -> bool + Send + Sync + 'static,
    {
        self.target = TransitionTarget::Branch {
            predicate: Arc::new(predicate),
            if_true: Box::new(TransitionTarget::To(if_true.to_string())),
            if_false: Box::new(TransitionTarget::To(if_false.to_string())),
        };
        self
    }

    pub(crate) fn binds_state(&self, state: &str) -> bool {
        self.from_state.as_deref().unwrap_or(INITIAL_STATE) == state
    }
}

/// Resolve a target to (state, completed). `None` means stay.
pub(crate) fn resolve_target(
    target: &TransitionTarget,
    data: &serde_json::Value,
    message: &Message,
) -> Option<(String, bool)> {
    match target {
        TransitionTarget::Stay => None,
        TransitionTarget::To(state) => Some((state.clone(), false)),
        TransitionTarget::Complete(state) => Some((state.clone(), true)),
        TransitionTarget::Branch {
            predicate,
            if_true,
            if_false,
        } => {
            let chosen = if predicate(data, message) {
                if_true
            } else {
                if_false
            };
            resolve_target(chosen, data, message)
        }
    }
}

/// Declarative state machine for one saga type.
pub struct SagaDefinition {
    name: String,
    transitions: Vec<TransitionSpec>,
    compensations: HashMap<String, CompensationFn>,
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transitions: Vec::new(),
            compensations: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind an event accepted before the instance exists. Receiving it
    /// creates a fresh instance.
    pub fn when_initial(&mut self, event_type: &str) -> &mut TransitionSpec {
        self.transitions
            .push(TransitionSpec::new(event_type.to_string(), None));
        self.transitions.last_mut().expect("just pushed")
    }

    /// Bind an event accepted in a named state.
    pub fn in_state(&mut self, state: &str, event_type: &str) -> &mut TransitionSpec {
        self.transitions.push(TransitionSpec::new(
            event_type.to_string(),
            Some(state.to_string()),
        ));
        self.transitions.last_mut().expect("just pushed")
    }

    /// Define a named compensation closure. It receives a snapshot of the
    /// instance data.
    pub fn define_compensation<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<(), ProcessingError>>
            + Send
            + Sync
            + 'static,
    {
        self.compensations.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Whether any transition binds this event type.
    pub fn handles_event(&self, event_type: &str) -> bool {
        self.transitions
            .iter()
            .any(|transition| transition.event_type == event_type)
    }

    /// All event types any transition binds.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .transitions
            .iter()
            .map(|transition| transition.event_type.as_str())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// The transition bound to (state, event type), if any.
    pub(crate) fn binding_for(&self, state: &str, event_type: &str) -> Option<&TransitionSpec> {
        self.transitions
            .iter()
            .find(|transition| transition.event_type == event_type && transition.binds_state(state))
    }

    /// Whether the event type can create a fresh instance.
    pub(crate) fn is_initial_event(&self, event_type: &str) -> bool {
        self.transitions
            .iter()
            .any(|transition| transition.event_type == event_type && transition.from_state.is_none())
    }

    /// Correlation id for an event: the first matching binding's
    /// correlation function, falling back to the envelope's correlation id.
    pub(crate) fn correlation_for(&self, message: &Message) -> Option<String> {
        let binding = self
            .transitions
            .iter()
            .find(|transition| transition.event_type == message.message_type)?;
        match &binding.correlate {
            Some(correlate) => correlate(message),
            None => message.correlation_id.clone(),
        }
    }

    pub(crate) fn compensation_fn(&self, name: &str) -> Option<CompensationFn> {
        self.compensations.get(name).cloned()
    }
}
