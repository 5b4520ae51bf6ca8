//! Strictly ordered execution of scenario steps.
//!
//! An [`Action`] is a deferred async closure over explicit shared handles.
//! Values produced by one step and consumed by a later one travel through a
//! [`Slot`]. [`ActionSequencer::execute`] runs the steps one at a time and
//! stops at the first failure, reporting which step failed.

use crate::error::{FailureKind, HarnessError, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// One scenario step.
pub struct Action {
    label: Option<String>,
    run: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl Action {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            label: None,
            run: Box::new(move || Box::pin(f())),
        }
    }

    /// Like [`Action::new`], with a label that shows up in failures and logs.
    pub fn named<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut action = Self::new(f);
        action.label = Some(label.into());
        action
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action").field("label", &self.label).finish()
    }
}

/// A step failed; the steps after it never ran.
#[derive(Debug, thiserror::Error)]
#[error("action #{index}{} failed: {source}", describe_label(.label))]
pub struct ScenarioError {
    pub index: usize,
    pub label: Option<String>,
    #[source]
    pub source: HarnessError,
}

fn describe_label(label: &Option<String>) -> String {
    label.as_deref().map(|l| format!(" ({l})")).unwrap_or_default()
}

impl ScenarioError {
    pub fn kind(&self) -> FailureKind {
        self.source.kind()
    }
}

/// Runs actions in order, one at a time.
#[derive(Debug, Default)]
pub struct ActionSequencer {
    completed: usize,
}

impl ActionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions that returned successfully across all `execute` calls.
    pub fn completed(&self) -> usize {
        self.completed
    }

    pub async fn execute(
        &mut self,
        actions: impl IntoIterator<Item = Action>,
    ) -> std::result::Result<(), ScenarioError> {
        for (index, action) in actions.into_iter().enumerate() {
            let Action { label, run } = action;
            debug!(index, label = label.as_deref().unwrap_or(""), "running action");
            if let Err(source) = run().await {
                warn!(
                    index,
                    label = label.as_deref().unwrap_or(""),
                    error = %source,
                    "action failed, aborting scenario"
                );
                return Err(ScenarioError {
                    index,
                    label,
                    source,
                });
            }
            self.completed += 1;
        }
        Ok(())
    }
}

/// A write-once-read-many handle passed between actions.
#[derive(Debug)]
pub struct Slot<T> {
    name: &'static str,
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Slot<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set(&self, value: T) {
        *self.value.lock() = Some(value);
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    pub fn take(&self) -> Result<T> {
        self.value
            .lock()
            .take()
            .ok_or_else(|| HarnessError::usage(format!("slot '{}' is empty", self.name)))
    }
}

impl<T: Clone> Slot<T> {
    pub fn get(&self) -> Result<T> {
        self.value
            .lock()
            .clone()
            .ok_or_else(|| {
                HarnessError::usage(format!("slot '{}' read before it was set", self.name))
            })
    }
}
