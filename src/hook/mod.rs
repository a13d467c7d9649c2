//! Observation hooks.
//!
//! A [`Hook`] is invoked around every instrumented database call:
//! `before` receives the call's context (with [`CallMeta`] already set) and
//! may return a derived context carrying its own values; `after` receives
//! that derived context and the call's error, if any. Every `before` is
//! paired with exactly one `after`.
//!
//! [`Hooks`] composes several hooks. Both `before` and `after` run in
//! registration order; each `before` sees the context returned by the
//! previous one and every `after` sees the same error.

pub mod call;
pub mod conn_id;
pub mod logging;

pub use call::{Action, CallMeta};
pub use conn_id::{ConnId, TaggedHook};
pub use logging::TracingHook;

use crate::context::{Context, ContextError};
use crate::error::DbError;
use std::sync::Arc;

pub trait Hook: Send + Sync {
    fn before(&self, ctx: Context) -> Context;

    fn after(&self, ctx: &Context, err: Option<&DbError>);
}

/// A hook that observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl Hook for NoopHook {
    fn before(&self, ctx: Context) -> Context {
        ctx
    }

    fn after(&self, _ctx: &Context, _err: Option<&DbError>) {}
}

/// Ordered composition of hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn Hook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl FromIterator<Arc<dyn Hook>> for Hooks {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Hook>>>(iter: I) -> Self {
        Self {
            hooks: iter.into_iter().collect(),
        }
    }
}

impl Hook for Hooks {
    fn before(&self, ctx: Context) -> Context {
        self.hooks.iter().fold(ctx, |ctx, hook| hook.before(ctx))
    }

    fn after(&self, ctx: &Context, err: Option<&DbError>) {
        for hook in &self.hooks {
            hook.after(ctx, err);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").field("len", &self.hooks.len()).finish()
    }
}

/// Run `f` between `hook.before` and `hook.after`.
///
/// `meta` is overlaid on the context's inherited call metadata. The result
/// of `f` is returned unchanged.
pub(crate) async fn observe<T, F, Fut>(
    hook: &dyn Hook,
    ctx: &Context,
    meta: CallMeta,
    f: F,
) -> Result<T, DbError>
where
    F: FnOnce(Context) -> Fut,
    Fut: std::future::Future<Output = Result<T, DbError>>,
{
    let pending = PendingAfter::new(hook, hook.before(ctx.with_call(meta)));
    let result = f(pending.ctx().clone()).await;
    pending.finish(result.as_ref().err());
    result
}

/// The `after` owed for a `before` that already ran.
///
/// Dropping it unfinished (the caller's future was dropped mid-call)
/// reports the call as canceled.
pub(crate) struct PendingAfter<'a> {
    hook: &'a dyn Hook,
    ctx: Context,
    finished: bool,
}

impl<'a> PendingAfter<'a> {
    pub(crate) fn new(hook: &'a dyn Hook, ctx: Context) -> Self {
        Self {
            hook,
            ctx,
            finished: false,
        }
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn finish(mut self, err: Option<&DbError>) {
        self.finished = true;
        self.hook.after(&self.ctx, err);
    }
}

impl Drop for PendingAfter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let err = DbError::Context(ContextError::Canceled);
            self.hook.after(&self.ctx, Some(&err));
        }
    }
}
