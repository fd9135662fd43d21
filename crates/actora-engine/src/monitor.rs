// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cooperative cancellation monitor.
//!
//! One monitor per run. Anything holding a clone can request cancellation;
//! anything doing work can poll [`check_cancelled`](CancellationMonitor::check_cancelled),
//! register a listener, or `select!` on [`cancelled`](CancellationMonitor::cancelled).

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::CancelledError;

type Listener = Box<dyn FnOnce() + Send + 'static>;

struct MonitorState {
    cancelled: bool,
    listeners: Vec<Listener>,
}

/// Shared cancellation flag with one-shot listeners.
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct CancellationMonitor {
    state: Arc<Mutex<MonitorState>>,
    notify: Arc<Notify>,
}

impl Default for CancellationMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationMonitor {
    /// Create a monitor in the not-cancelled state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                cancelled: false,
                listeners: Vec::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Register a listener fired exactly once on cancellation.
    ///
    /// A listener added after cancellation fires immediately, so there is
    /// no window in which a cancellation can be missed.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fire_now = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                true
            } else {
                state.listeners.push(Box::new(listener));
                return;
            }
        };
        if fire_now {
            listener();
        }
    }

    /// Request cancellation. Idempotent: listeners fire exactly once across
    /// any number of calls.
    pub fn cancel(&self) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.listeners)
        };

        debug!(listeners = listeners.len(), "Cancellation requested");
        for listener in listeners {
            listener();
        }
        self.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Poll point for cooperative work loops.
    pub fn check_cancelled(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation is requested. Resolves immediately when the
    /// monitor is already cancelled.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
