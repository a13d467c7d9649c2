//! Per-connection identifiers.
//!
//! Every physical connection gets a random token at connect time. The token
//! is injected into the context of each call made on that connection so log
//! lines and traces can be correlated to a single connection. Tokens are for
//! correlation only; collisions are harmless.

use super::Hook;
use crate::context::Context;
use crate::error::DbError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};

/// Process-wide generator shared by all connectors.
static SOURCE: LazyLock<Mutex<StdRng>> = LazyLock::new(|| Mutex::new(StdRng::from_entropy()));

/// Random identifier of one physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnId(Arc<str>);

impl ConnId {
    /// Draw a new identifier from the shared source.
    pub fn generate() -> Self {
        let n: u64 = {
            let mut rng = SOURCE.lock().unwrap_or_else(|p| p.into_inner());
            rng.r#gen()
        };
        Self(Arc::from(format!("conn_{:016x}", n)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hook adapter that stamps the connection id on the context before the
/// configured hook sees it.
pub struct TaggedHook {
    id: ConnId,
    inner: Arc<dyn Hook>,
}

impl TaggedHook {
    pub fn new(id: ConnId, inner: Arc<dyn Hook>) -> Self {
        Self { id, inner }
    }

    pub fn id(&self) -> &ConnId {
        &self.id
    }
}

impl Hook for TaggedHook {
    fn before(&self, ctx: Context) -> Context {
        self.inner.before(ctx.with_conn_id(self.id.clone()))
    }

    fn after(&self, ctx: &Context, err: Option<&DbError>) {
        self.inner.after(ctx, err)
    }
}
