//! Per-call metadata surfaced to hooks.

use crate::models::Value;
use std::fmt;

/// Logical kind of an instrumented call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Prepare,
    Query,
    Exec,
    /// Spans a whole transaction, begin through commit or rollback.
    Tx,
    Begin,
    Commit,
    Rollback,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Query => "query",
            Self::Exec => "exec",
            Self::Tx => "tx",
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive record of one database call.
///
/// Every field is optional so a record can be overlaid on an inherited one:
/// see [`CallMeta::overlay`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMeta {
    operation: Option<String>,
    action: Option<Action>,
    statement: Option<String>,
    args: Option<Vec<Value>>,
}

impl CallMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    pub fn args(mut self, args: &[Value]) -> Self {
        self.args = Some(args.to_vec());
        self
    }

    /// Fields set on `top` win; the rest are inherited from `self`.
    pub fn overlay(&self, top: CallMeta) -> CallMeta {
        CallMeta {
            operation: top.operation.or_else(|| self.operation.clone()),
            action: top.action.or(self.action),
            statement: top.statement.or_else(|| self.statement.clone()),
            args: top.args.or_else(|| self.args.clone()),
        }
    }

    pub fn get_operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn get_action(&self) -> Option<Action> {
        self.action
    }

    pub fn get_statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    pub fn get_args(&self) -> &[Value] {
        self.args.as_deref().unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_top() {
        let base = CallMeta::new()
            .operation("outer")
            .action(Action::Tx)
            .statement("BEGIN");
        let merged = base.overlay(CallMeta::new().action(Action::Exec).statement("DELETE"));
        assert_eq!(merged.get_operation(), Some("outer"));
        assert_eq!(merged.get_action(), Some(Action::Exec));
        assert_eq!(merged.get_statement(), Some("DELETE"));
        assert!(merged.get_args().is_empty());
    }

    #[test]
    fn test_overlay_leaves_base_untouched() {
        let base = CallMeta::new().statement("SELECT 1");
        let _ = base.overlay(CallMeta::new().args(&[Value::Int(1)]));
        assert!(base.get_args().is_empty());
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::Rollback.to_string(), "rollback");
        assert_eq!(Action::Tx.as_str(), "tx");
    }
}
