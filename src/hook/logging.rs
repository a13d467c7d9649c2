//! Hook that reports every instrumented call through `tracing`.

use super::Hook;
use crate::context::Context;
use crate::error::DbError;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Start time stored by [`TracingHook::before`].
#[derive(Debug, Clone, Copy)]
struct CallStart(Instant);

/// Logs each call with its action, operation, statement and duration.
///
/// Arguments are only logged when `log_args` is set, since they may carry
/// user data.
#[derive(Debug, Clone, Default)]
pub struct TracingHook {
    log_args: bool,
}

impl TracingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, log_args: bool) -> Self {
        self.log_args = log_args;
        self
    }
}

impl Hook for TracingHook {
    fn before(&self, ctx: Context) -> Context {
        ctx.with_value(CallStart(Instant::now()))
    }

    fn after(&self, ctx: &Context, err: Option<&DbError>) {
        let call = ctx.call();
        let elapsed_ms = ctx
            .value::<CallStart>()
            .map(|s| s.0.elapsed().as_millis() as u64)
            .unwrap_or_default();
        let action = call.get_action().map(|a| a.as_str()).unwrap_or("");
        let operation = call.get_operation().unwrap_or("");
        let statement = call.get_statement().unwrap_or("");
        let conn_id = ctx.conn_id().map(|c| c.as_str()).unwrap_or("");
        let args = if self.log_args {
            serde_json::to_string(call.get_args()).unwrap_or_default()
        } else {
            String::new()
        };

        match err {
            Some(e) => warn!(
                action,
                operation,
                statement,
                conn_id,
                args = %args,
                elapsed_ms,
                error = %e,
                "Database call failed"
            ),
            None => debug!(
                action,
                operation,
                statement,
                conn_id,
                args = %args,
                elapsed_ms,
                "Database call"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{Action, CallMeta};

    #[test]
    fn test_before_records_start() {
        let hook = TracingHook::new();
        let ctx = hook.before(Context::background().with_call(CallMeta::new().action(Action::Query)));
        assert!(ctx.value::<CallStart>().is_some());
        hook.after(&ctx, None);
        hook.after(&ctx, Some(&DbError::RowNotFound));
    }
}
