//! Request-scoped context.
//!
//! A [`Context`] carries cancellation, an optional deadline, the metadata of
//! the in-flight database call and arbitrary typed values. It is immutable:
//! every `with_*` method returns a new handle and leaves the receiver as it
//! was, so a callee can never change what its caller observes.

use crate::hook::call::CallMeta;
use crate::hook::conn_id::ConnId;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

type ValueMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

#[derive(Clone)]
pub struct Context {
    scope: Option<Arc<CancelScope>>,
    deadline: Option<Instant>,
    call: Arc<CallMeta>,
    conn_id: Option<ConnId>,
    values: Arc<ValueMap>,
}

impl Context {
    /// A context that is never cancelled and carries nothing.
    pub fn background() -> Self {
        Self {
            scope: None,
            deadline: None,
            call: Arc::new(CallMeta::default()),
            conn_id: None,
            values: Arc::new(HashMap::new()),
        }
    }

    /// Derive a cancellable child.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let scope = CancelScope::child_of(self.scope.as_ref());
        let ctx = Self {
            scope: Some(scope.clone()),
            ..self.clone()
        };
        (ctx, CancelHandle { scope })
    }

    /// Derive a child that expires at `deadline`, or at the parent's deadline
    /// if that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        let (mut ctx, handle) = self.with_cancel();
        ctx.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        (ctx, handle)
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(err) = self.scope.as_ref().and_then(|s| s.err()) {
            return Some(err);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        loop {
            let notified = self.scope.as_ref().map(|s| s.notify.notified());
            tokio::pin!(notified);
            if let Some(n) = notified.as_mut().as_pin_mut() {
                n.enable();
            }
            if self.err().is_some() {
                return;
            }
            match (notified.as_mut().as_pin_mut(), self.deadline) {
                (Some(n), Some(deadline)) => {
                    tokio::select! {
                        _ = n => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                (Some(n), None) => n.await,
                (None, Some(deadline)) => tokio::time::sleep_until(deadline).await,
                (None, None) => std::future::pending::<()>().await,
            }
        }
    }

    /// Run `fut` unless the context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ContextError>
    where
        F: std::future::Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            _ = self.done() => Err(self.err().unwrap_or(ContextError::Canceled)),
        }
    }

    /// Metadata of the call this context belongs to.
    pub fn call(&self) -> &CallMeta {
        &self.call
    }

    /// Overlay `meta` on the inherited metadata. Fields left unset in `meta`
    /// keep their inherited value.
    pub fn with_call(&self, meta: CallMeta) -> Self {
        Self {
            call: Arc::new(self.call.overlay(meta)),
            ..self.clone()
        }
    }

    /// Name the logical operation for every call made under this context.
    pub fn with_operation(&self, operation: impl Into<String>) -> Self {
        self.with_call(CallMeta::new().operation(operation))
    }

    pub fn conn_id(&self) -> Option<&ConnId> {
        self.conn_id.as_ref()
    }

    pub fn with_conn_id(&self, id: ConnId) -> Self {
        Self {
            conn_id: Some(id),
            ..self.clone()
        }
    }

    /// Attach a typed value, replacing any value of the same type.
    pub fn with_value<T>(&self, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    pub fn value<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("err", &self.err())
            .field("deadline", &self.deadline)
            .field("call", &self.call)
            .field("conn_id", &self.conn_id)
            .field("values", &self.values.len())
            .finish()
    }
}

/// Cancels the context it was created with, and all of its descendants.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    scope: Arc<CancelScope>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.scope.cancel(ContextError::Canceled);
    }
}

#[derive(Debug)]
struct CancelScope {
    state: Mutex<Option<ContextError>>,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelScope>>>,
}

impl CancelScope {
    fn child_of(parent: Option<&Arc<CancelScope>>) -> Arc<Self> {
        let scope = Arc::new(Self {
            state: Mutex::new(None),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        });
        if let Some(parent) = parent {
            // Hold the parent's child list while checking its state so a
            // concurrent cancel either sees this child or we see its state.
            let mut children = lock(&parent.children);
            match parent.err() {
                Some(err) => *lock(&scope.state) = Some(err),
                None => {
                    children.retain(|c| c.strong_count() > 0);
                    children.push(Arc::downgrade(&scope));
                }
            }
        }
        scope
    }

    fn err(&self) -> Option<ContextError> {
        *lock(&self.state)
    }

    fn cancel(&self, err: ContextError) {
        let children = {
            let mut children = lock(&self.children);
            {
                let mut state = lock(&self.state);
                if state.is_some() {
                    return;
                }
                *state = Some(err);
            }
            std::mem::take(&mut *children)
        };
        self.notify.notify_waiters();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(err);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
