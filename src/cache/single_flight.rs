// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-flight deduplication of in-flight operations.
//!
//! Concurrent callers asking for the same logical operation (named by
//! operation + key, e.g. `get:session`) share one future instead of each
//! issuing its own durable-store read.

use std::collections::HashMap;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};

/// A shareable in-flight task.
pub type SharedTask<T> = Shared<BoxFuture<'static, T>>;

/// Registry of in-flight tasks keyed by name.
///
/// Each capture is tagged with a ticket so a waiter finishing late cannot
/// retire a newer task registered under the same name.
pub struct SingleFlight<T: Clone> {
    tasks: HashMap<String, (u64, SharedTask<T>)>,
    next_ticket: u64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
            next_ticket: 0,
        }
    }
}

/// Outcome of [`SingleFlight::capture`].
pub struct Captured<T: Clone> {
    pub ticket: u64,
    pub task: SharedTask<T>,
    /// `true` when this call joined a task someone else started
    pub joined: bool,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    #[must_use]
    pub fn has_pending(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Ticket of the task currently registered under `name`.
    #[must_use]
    pub fn ticket(&self, name: &str) -> Option<u64> {
        self.tasks.get(name).map(|(ticket, _)| *ticket)
    }

    /// Return the in-flight task for `name`, starting it with `producer` if
    /// nothing is running yet. `producer` is only called when starting.
    pub fn capture<F, Fut>(&mut self, name: &str, producer: F) -> Captured<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if let Some((ticket, task)) = self.tasks.get(name) {
            return Captured {
                ticket: *ticket,
                task: task.clone(),
                joined: true,
            };
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let task = producer().boxed().shared();
        self.tasks.insert(name.to_string(), (ticket, task.clone()));
        Captured {
            ticket,
            task,
            joined: false,
        }
    }

    /// Retire the task registered under `name` if it is still `ticket`.
    pub fn finish(&mut self, name: &str, ticket: u64) -> bool {
        match self.tasks.get(name) {
            Some((current, _)) if *current == ticket => {
                self.tasks.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
