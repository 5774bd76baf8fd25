//! Event subscription table.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use serde_json::Value;
use vts_core::requests::{EventSubscriptionRequest, EventSubscriptionResponse};
use vts_core::{ApiError, Event};

use crate::retry::RetryState;

/// Receives decoded events for one subscription.
pub(crate) trait EventHandler {
    fn dispatch(&mut self, data: Value) -> Result<(), serde_json::Error>;
}

struct TypedEventHandler<E, F> {
    on_event: F,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event, F: FnMut(E)> EventHandler for TypedEventHandler<E, F> {
    fn dispatch(&mut self, data: Value) -> Result<(), serde_json::Error> {
        let event = serde_json::from_value::<E>(data)?;
        (self.on_event)(event);
        Ok(())
    }
}

pub(crate) fn event_handler<E, F>(on_event: F) -> Box<dyn EventHandler>
where
    E: Event,
    F: FnMut(E) + 'static,
{
    Box::new(TypedEventHandler {
        on_event,
        _event: PhantomData,
    })
}

/// A caller's subscription waiting for the host to confirm it.
pub(crate) struct PendingSubscription {
    pub(crate) event_name: String,
    pub(crate) config: Value,
    pub(crate) on_event: Box<dyn EventHandler>,
    pub(crate) on_subscribed: Box<dyn FnOnce(EventSubscriptionResponse)>,
    pub(crate) on_error: Box<dyn FnOnce(ApiError)>,
}

impl PendingSubscription {
    /// Split into the table entry and the confirmation callback.
    pub(crate) fn confirm(self) -> (Subscription, Box<dyn FnOnce(EventSubscriptionResponse)>) {
        let subscription = Subscription {
            event_name: self.event_name,
            config: self.config,
            active: true,
            on_event: self.on_event,
            retry: RetryState::default(),
        };
        (subscription, self.on_subscribed)
    }

    pub(crate) fn fail(self, error: ApiError) {
        (self.on_error)(error);
    }
}

/// A caller's unsubscription waiting for the host to confirm it.
pub(crate) struct PendingUnsubscription {
    pub(crate) event_name: String,
    pub(crate) on_unsubscribed: Box<dyn FnOnce(EventSubscriptionResponse)>,
    pub(crate) on_error: Box<dyn FnOnce(ApiError)>,
}

/// A confirmed subscription.
///
/// Survives reconnects; it is replayed to the host after every successful
/// authentication until the caller unsubscribes.
pub(crate) struct Subscription {
    event_name: String,
    config: Value,
    active: bool,
    on_event: Box<dyn EventHandler>,
    /// Backoff for a rejected resubscription.
    pub(crate) retry: RetryState,
}

impl Subscription {
    pub(crate) fn request(&self) -> EventSubscriptionRequest {
        EventSubscriptionRequest {
            event_name: self.event_name.clone(),
            subscribe: true,
            config: self.config.clone(),
        }
    }
}

/// Subscriptions keyed by event name; at most one per event.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: HashMap<String, Subscription>,
}

impl SubscriptionTable {
    /// Insert or replace the entry for this event.
    pub(crate) fn insert(&mut self, subscription: Subscription) {
        self.entries
            .insert(subscription.event_name.clone(), subscription);
    }

    pub(crate) fn remove(&mut self, event_name: &str) -> bool {
        self.entries.remove(event_name).is_some()
    }

    pub(crate) fn get_mut(&mut self, event_name: &str) -> Option<&mut Subscription> {
        self.entries.get_mut(event_name)
    }

    pub(crate) fn set_active(&mut self, event_name: &str, active: bool) {
        if let Some(entry) = self.entries.get_mut(event_name) {
            entry.active = active;
        }
    }

    /// Names of active subscriptions, sorted.
    pub(crate) fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .values()
            .filter(|s| s.active)
            .map(|s| s.event_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Deliver an event payload. Returns false if no active entry exists.
    pub(crate) fn dispatch(&mut self, event_name: &str, data: Value) -> Result<bool, serde_json::Error> {
        match self.entries.get_mut(event_name) {
            Some(entry) if entry.active => {
                entry.on_event.dispatch(data)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drop entries an in-flight unsubscribe had already deactivated.
    pub(crate) fn remove_inactive(&mut self) {
        self.entries.retain(|_, s| s.active);
    }

    pub(crate) fn reset_retries(&mut self) {
        for entry in self.entries.values_mut() {
            entry.retry.reset();
        }
    }

    /// Advance resubscribe timers; returns the events due for a resend.
    pub(crate) fn due_retries(&mut self, delta: Duration) -> Vec<String> {
        let mut due: Vec<String> = self
            .entries
            .values_mut()
            .filter_map(|s| (s.active && s.retry.advance(delta)).then(|| s.event_name.clone()))
            .collect();
        due.sort();
        due
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
