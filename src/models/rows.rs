//! Result sets and execution results.

use super::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
}

/// A fully materialized result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    columns: Arc<[String]>,
    rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.into(),
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Row> {
        self.rows.get(idx).map(|values| Row {
            columns: self.columns.clone(),
            values: values.clone(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Row> + '_ {
        self.rows.iter().map(|values| Row {
            columns: self.columns.clone(),
            values: values.clone(),
        })
    }

    /// Apply `f` to every value of column `idx`.
    pub fn map_column<F>(&mut self, idx: usize, mut f: F) -> Result<(), crate::error::DbError>
    where
        F: FnMut(Value) -> Result<Value, crate::error::DbError>,
    {
        for row in &mut self.rows {
            if let Some(slot) = row.get_mut(idx) {
                let value = std::mem::replace(slot, Value::Null);
                *slot = f(value)?;
            }
        }
        Ok(())
    }

    /// Render as a list of JSON objects keyed by column name.
    pub fn to_json(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.iter().map(|r| r.to_json()).collect()
    }
}

/// One row of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| {
                (
                    c.clone(),
                    serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Rows {
        Rows::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![Value::Int(1), Value::from("ada")],
                vec![Value::Int(2), Value::from("grace")],
            ],
        )
    }

    #[test]
    fn test_row_lookup_by_name() {
        let rows = sample();
        let row = rows.get(1).unwrap();
        assert_eq!(row.get_by_name("name"), Some(&Value::from("grace")));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn test_map_column() {
        let mut rows = sample();
        rows.map_column(0, |v| Ok(Value::Int(v.as_i64().unwrap() * 10)))
            .unwrap();
        assert_eq!(rows.get(0).unwrap().get(0), Some(&Value::Int(10)));
        assert_eq!(rows.get(1).unwrap().get(0), Some(&Value::Int(20)));
    }

    #[test]
    fn test_to_json() {
        let json = sample().to_json();
        assert_eq!(json.len(), 2);
        assert_eq!(json[0]["name"], "ada");
    }
}
