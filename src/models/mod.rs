//! Values and result types passed across the driver boundary.

pub mod rows;
pub mod value;

pub use rows::{ExecResult, Row, Rows};
pub use value::{NamedValue, Value};
