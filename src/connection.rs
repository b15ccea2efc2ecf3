// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection manager.
//!
//! Callers connect with a target and a callback. Identical targets share one
//! hub registration; the manager fans each notification out to every
//! callback on that registration and replays the last known payload to
//! callbacks that join late.
//!
//! # State machine
//!
//! ```text
//! Pending ──bind──▶ Active ──last disconnect──▶ Draining ──teardown──▶ Closed
//!                    ▲  │
//!                    └──┘ callbacks added/removed while count > 0
//! ```
//!
//! The manager never calls callbacks itself: it hands back [`Dispatch`]es
//! so the store can run them after releasing its lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::notify::{Notification, Payload, SubscriptionId, Target};

pub type Callback = Arc<dyn Fn(&Payload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the store to register it with the hub
    Pending,
    /// Registered, at least one callback attached
    Active,
    /// Last callback gone, teardown in progress
    Draining,
    /// Torn down (or never existed)
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Draining => write!(f, "Draining"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Arguments to [`Store::connect`](crate::Store::connect).
#[derive(Clone)]
pub struct ConnectOptions {
    pub target: Target,
    pub callback: Callback,
}

impl ConnectOptions {
    /// Watch a single key.
    pub fn key<F>(key: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        Self {
            target: Target::key(key),
            callback: Arc::new(callback),
        }
    }

    /// Watch every member of a collection as one mapping.
    pub fn collection<F>(collection_key: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        Self {
            target: Target::collection(collection_key),
            callback: Arc::new(callback),
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A callback invocation to run outside the store lock.
pub struct Dispatch {
    pub handle: ConnectionHandle,
    pub callback: Callback,
    pub payload: Payload,
}

impl Dispatch {
    pub fn deliver(self) {
        (self.callback)(&self.payload);
    }
}

struct Listener {
    callback: Callback,
    last_delivered: Option<Payload>,
}

struct Registration {
    subscription: Option<SubscriptionId>,
    state: ConnectionState,
    listeners: BTreeMap<ConnectionHandle, Listener>,
    last_payload: Option<Payload>,
}

/// Result of [`ConnectionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub handle: ConnectionHandle,
    /// `true` if this is the first callback on the target, so the store
    /// must register and prime it
    pub new_registration: bool,
}

/// Hub bookkeeping left behind by the last disconnect on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub target: Target,
    pub subscription: Option<SubscriptionId>,
}

#[derive(Default)]
pub struct ConnectionManager {
    registrations: HashMap<Target, Registration>,
    handles: HashMap<ConnectionHandle, Target>,
    by_subscription: HashMap<SubscriptionId, Target>,
    next_handle: u64,
}

impl ConnectionManager {
    pub fn connect(&mut self, options: ConnectOptions) -> Connected {
        self.next_handle += 1;
        let handle = ConnectionHandle(self.next_handle);

        let new_registration = !self.registrations.contains_key(&options.target);
        let registration = self
            .registrations
            .entry(options.target.clone())
            .or_insert_with(|| Registration {
                subscription: None,
                state: ConnectionState::Pending,
                listeners: BTreeMap::new(),
                last_payload: None,
            });
        registration.listeners.insert(
            handle,
            Listener {
                callback: options.callback,
                last_delivered: None,
            },
        );
        self.handles.insert(handle, options.target.clone());
        debug!(handle = handle.0, target = %options.target, new_registration, "Connected");
        crate::metrics::set_connections(self.handles.len());

        Connected { handle, new_registration }
    }

    /// Attach a hub subscription to a pending registration.
    pub fn bind(&mut self, target: &Target, subscription: SubscriptionId) -> bool {
        let Some(registration) = self.registrations.get_mut(target) else {
            return false;
        };
        if registration.state != ConnectionState::Pending {
            return false;
        }
        registration.subscription = Some(subscription);
        registration.state = ConnectionState::Active;
        self.by_subscription.insert(subscription, target.clone());
        true
    }

    /// Registrations still waiting for a hub subscription.
    #[must_use]
    pub fn pending_targets(&self) -> Vec<Target> {
        let mut pending: Vec<Target> = self
            .registrations
            .iter()
            .filter(|(_, registration)| registration.state == ConnectionState::Pending)
            .map(|(target, _)| target.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Remove one callback. Idempotent. Returns the teardown to perform when
    /// it was the last callback on its target.
    pub fn disconnect(&mut self, handle: ConnectionHandle) -> Option<Teardown> {
        let target = self.handles.remove(&handle)?;
        crate::metrics::set_connections(self.handles.len());
        let registration = self.registrations.get_mut(&target)?;
        registration.listeners.remove(&handle);
        debug!(handle = handle.0, target = %target, remaining = registration.listeners.len(), "Disconnected");
        if !registration.listeners.is_empty() {
            return None;
        }

        registration.state = ConnectionState::Draining;
        let subscription = registration.subscription.take();
        if let Some(subscription) = subscription {
            self.by_subscription.remove(&subscription);
        }
        Some(Teardown { target, subscription })
    }

    /// Finish a teardown started by [`disconnect`](Self::disconnect).
    pub fn close(&mut self, teardown: &Teardown) {
        let draining = self
            .registrations
            .get(&teardown.target)
            .is_some_and(|registration| registration.state == ConnectionState::Draining);
        if draining {
            self.registrations.remove(&teardown.target);
        }
    }

    #[must_use]
    pub fn state(&self, handle: ConnectionHandle) -> ConnectionState {
        self.handles
            .get(&handle)
            .and_then(|target| self.registrations.get(target))
            .map_or(ConnectionState::Closed, |registration| registration.state)
    }

    /// Deliver hub notifications to every callback that has not already
    /// seen an equal payload.
    pub fn fan_out(&mut self, notifications: Vec<Notification>) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        for notification in notifications {
            let Some(target) = self.by_subscription.get(&notification.subscription) else {
                continue;
            };
            let Some(registration) = self.registrations.get_mut(target) else {
                continue;
            };
            registration.last_payload = Some(notification.payload.clone());
            for (handle, listener) in &mut registration.listeners {
                if let Some(last) = &listener.last_delivered {
                    if Arc::ptr_eq(last, &notification.payload) || **last == *notification.payload {
                        continue;
                    }
                }
                listener.last_delivered = Some(notification.payload.clone());
                dispatches.push(Dispatch {
                    handle: *handle,
                    callback: listener.callback.clone(),
                    payload: notification.payload.clone(),
                });
            }
        }
        dispatches
    }

    /// Last known payload for a callback that has not received anything yet.
    pub fn take_replay(&mut self, handle: ConnectionHandle) -> Option<Dispatch> {
        let target = self.handles.get(&handle)?;
        let registration = self.registrations.get_mut(target)?;
        let payload = registration.last_payload.clone()?;
        let listener = registration.listeners.get_mut(&handle)?;
        if listener.last_delivered.is_some() {
            return None;
        }
        listener.last_delivered = Some(payload.clone());
        Some(Dispatch {
            handle,
            callback: listener.callback.clone(),
            payload,
        })
    }

    #[must_use]
    pub fn subscription(&self, target: &Target) -> Option<SubscriptionId> {
        self.registrations.get(target).and_then(|registration| registration.subscription)
    }

    #[must_use]
    pub fn target(&self, handle: ConnectionHandle) -> Option<&Target> {
        self.handles.get(&handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.handles.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }
}
