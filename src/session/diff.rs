//! Folds a streaming result's signed-event log into its current snapshot.
//!
//! Subscriptions deliver an append-only sequence of row events, each weighted
//! by a signed multiplicity. The accumulator keeps a running sum per distinct
//! data row and keeps only the rows whose sum is positive. Pure over the
//! event prefix: re-running on a longer prefix agrees with applying just the
//! suffix incrementally.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::{DIFF_COLUMN, PROGRESS_COLUMN, TIMESTAMP_COLUMN};
use crate::session::machine::CommandResult;

/// Desynchronization defect in the event log. Never skipped over: a bad
/// multiplicity means the client and engine no longer agree on the protocol.
#[derive(thiserror::Error, Debug)]
pub enum DiffError {
    #[error("streaming result is missing the {DIFF_COLUMN} column")]
    MissingDiffColumn,
    #[error("row {index} carries a malformed multiplicity: {value}")]
    MalformedMultiplicity { index: usize, value: Value },
    #[error("row {index} has {actual} fields, expected {expected}")]
    RowWidthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// A result's rows as the console should display them, reserved metadata
/// columns stripped and multiplicities collapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRows {
    pub cols: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Materialize one result for display. Only streaming row sets pass through
/// the accumulator; everything else is returned as received.
pub fn materialize(result: &CommandResult) -> Result<MaterializedRows, DiffError> {
    if !(result.shape.is_streaming() && result.shape.has_rows()) {
        return Ok(MaterializedRows {
            cols: result.cols.clone().unwrap_or_default(),
            rows: result.rows.clone(),
        });
    }
    match &result.cols {
        Some(cols) => merge_row_updates(cols, &result.rows),
        // Between the start announcement and the column frame there is
        // nothing to show yet; an empty log merges to an empty snapshot.
        None if result.rows.is_empty() => Ok(MaterializedRows {
            cols: Vec::new(),
            rows: Vec::new(),
        }),
        // Row events without a column frame mean the feed is out of step.
        None => Err(DiffError::MissingDiffColumn),
    }
}

/// Collapse a signed-event log into the deduplicated current row set. Output
/// row order is unspecified.
pub fn merge_row_updates(
    cols: &[String],
    rows: &[Vec<Value>],
) -> Result<MaterializedRows, DiffError> {
    let diff_idx = cols
        .iter()
        .position(|c| c == DIFF_COLUMN)
        .ok_or(DiffError::MissingDiffColumn)?;
    let progress_idx = cols.iter().position(|c| c == PROGRESS_COLUMN);
    let reserved = |idx: usize| {
        idx == diff_idx
            || progress_idx == Some(idx)
            || cols.get(idx).is_some_and(|c| c == TIMESTAMP_COLUMN)
    };

    let data_cols: Vec<String> = cols
        .iter()
        .enumerate()
        .filter(|(idx, _)| !reserved(*idx))
        .map(|(_, col)| col.clone())
        .collect();

    let mut counts: HashMap<String, (Vec<Value>, i64)> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        if row.len() != cols.len() {
            return Err(DiffError::RowWidthMismatch {
                index,
                expected: cols.len(),
                actual: row.len(),
            });
        }
        // Progress markers carry no data payload.
        if let Some(progress_idx) = progress_idx {
            if row[progress_idx] == Value::Bool(true) {
                continue;
            }
        }
        let multiplicity = parse_multiplicity(index, &row[diff_idx])?;
        let data: Vec<Value> = row
            .iter()
            .enumerate()
            .filter(|(idx, _)| !reserved(*idx))
            .map(|(_, value)| value.clone())
            .collect();
        // JSON text of the data fields is the dedup key.
        let key = serde_json::to_string(&data).expect("row values are already JSON");
        let count = {
            let entry = counts.entry(key.clone()).or_insert_with(|| (data, 0));
            entry.1 += multiplicity;
            entry.1
        };
        if count <= 0 {
            counts.remove(&key);
        }
    }

    Ok(MaterializedRows {
        cols: data_cols,
        rows: counts.into_values().map(|(row, _)| row).collect(),
    })
}

fn parse_multiplicity(index: usize, value: &Value) -> Result<i64, DiffError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| DiffError::MalformedMultiplicity {
            index,
            value: value.clone(),
        }),
        // Engines that render bigints as text still mean an integer.
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| DiffError::MalformedMultiplicity {
                index,
                value: value.clone(),
            }),
        _ => Err(DiffError::MalformedMultiplicity {
            index,
            value: value.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscribe_cols() -> Vec<String> {
        vec![
            TIMESTAMP_COLUMN.to_string(),
            PROGRESS_COLUMN.to_string(),
            DIFF_COLUMN.to_string(),
            "value".to_string(),
        ]
    }

    fn event(ts: u64, diff: i64, value: &str) -> Vec<Value> {
        vec![json!(ts), json!(false), json!(diff), json!(value)]
    }

    fn progress(ts: u64) -> Vec<Value> {
        vec![json!(ts), json!(true), Value::Null, Value::Null]
    }

    fn sorted(rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
        let mut rows = rows;
        rows.sort_by_key(|row| serde_json::to_string(row).unwrap());
        rows
    }

    #[test]
    fn insert_insert_delete_settles_at_one_copy() {
        let rows = vec![event(1, 1, "x"), event(2, 1, "x"), event(3, -1, "x")];
        let merged = merge_row_updates(&subscribe_cols(), &rows).unwrap();
        assert_eq!(merged.cols, vec!["value".to_string()]);
        assert_eq!(merged.rows, vec![vec![json!("x")]]);
    }

    #[test]
    fn row_retracted_to_zero_disappears() {
        let rows = vec![event(1, 2, "x"), event(2, -2, "x"), event(2, 1, "y")];
        let merged = merge_row_updates(&subscribe_cols(), &rows).unwrap();
        assert_eq!(merged.rows, vec![vec![json!("y")]]);
    }

    #[test]
    fn presence_tracks_the_running_sum() {
        // Interleaved weights for the same key: present iff the prefix sum
        // is positive at the end of the log.
        let rows = vec![
            event(1, 3, "x"),
            event(2, -1, "x"),
            event(3, -1, "x"),
            event(4, -1, "x"),
        ];
        let merged = merge_row_updates(&subscribe_cols(), &rows).unwrap();
        assert!(merged.rows.is_empty());
    }

    #[test]
    fn longer_prefix_agrees_with_incremental_application() {
        let prefix = vec![event(1, 1, "a"), event(1, 1, "b")];
        let mut longer = prefix.clone();
        longer.push(event(2, -1, "a"));
        longer.push(event(2, 1, "b"));

        let cols = subscribe_cols();
        let from_prefix = merge_row_updates(&cols, &prefix).unwrap();
        assert_eq!(
            sorted(from_prefix.rows),
            sorted(vec![vec![json!("a")], vec![json!("b")]])
        );
        let from_longer = merge_row_updates(&cols, &longer).unwrap();
        assert_eq!(from_longer.rows, vec![vec![json!("b")]]);

        // Re-running on the same prefix is idempotent.
        let again = merge_row_updates(&cols, &longer).unwrap();
        assert_eq!(again, from_longer);
    }

    #[test]
    fn progress_markers_are_skipped() {
        let rows = vec![event(1, 1, "x"), progress(2), event(3, 1, "y")];
        let merged = merge_row_updates(&subscribe_cols(), &rows).unwrap();
        assert_eq!(
            sorted(merged.rows),
            sorted(vec![vec![json!("x")], vec![json!("y")]])
        );
    }

    #[test]
    fn textual_multiplicity_is_accepted() {
        let rows = vec![vec![json!(1), json!(false), json!("2"), json!("x")]];
        let merged = merge_row_updates(&subscribe_cols(), &rows).unwrap();
        assert_eq!(merged.rows, vec![vec![json!("x")]]);
    }

    #[test]
    fn malformed_multiplicity_is_an_error() {
        let rows = vec![vec![json!(1), json!(false), json!("nope"), json!("x")]];
        let err = merge_row_updates(&subscribe_cols(), &rows).unwrap_err();
        assert!(matches!(
            err,
            DiffError::MalformedMultiplicity { index: 0, .. }
        ));

        let rows = vec![vec![json!(1), json!(false), Value::Null, json!("x")]];
        assert!(merge_row_updates(&subscribe_cols(), &rows).is_err());
    }

    #[test]
    fn non_streaming_results_pass_through_unchanged() {
        use crate::session::machine::ResultShape;
        let result = CommandResult {
            shape: ResultShape::Rowset,
            notices: Vec::new(),
            error: None,
            cols: Some(vec!["a".to_string()]),
            rows: vec![vec![json!(1)], vec![json!(1)]],
            complete_tag: Some("SELECT 2".into()),
            started_at_ms: 0,
            finished_at_ms: None,
        };
        let materialized = materialize(&result).unwrap();
        assert_eq!(materialized.cols, vec!["a".to_string()]);
        // Duplicates survive: nothing to collapse for a one-shot query.
        assert_eq!(materialized.rows.len(), 2);
    }

    #[test]
    fn just_started_stream_materializes_to_empty_snapshot() {
        use crate::session::machine::ResultShape;
        // Valid mid-protocol window: the subscription was announced but the
        // column frame has not arrived yet.
        let mut result = CommandResult {
            shape: ResultShape::Stream { has_rows: true },
            notices: Vec::new(),
            error: None,
            cols: None,
            rows: Vec::new(),
            complete_tag: None,
            started_at_ms: 0,
            finished_at_ms: None,
        };
        let materialized = materialize(&result).unwrap();
        assert!(materialized.cols.is_empty());
        assert!(materialized.rows.is_empty());

        // Columns known but no events yet: still an empty snapshot.
        result.cols = Some(subscribe_cols());
        let materialized = materialize(&result).unwrap();
        assert_eq!(materialized.cols, vec!["value".to_string()]);
        assert!(materialized.rows.is_empty());

        // Row events with no column frame at all are a desync, not a state.
        result.cols = None;
        result.rows = vec![event(1, 1, "x")];
        assert!(materialize(&result).is_err());
    }

    #[test]
    fn streaming_result_is_collapsed_on_materialize() {
        use crate::session::machine::ResultShape;
        let result = CommandResult {
            shape: ResultShape::Stream { has_rows: true },
            notices: Vec::new(),
            error: None,
            cols: Some(subscribe_cols()),
            rows: vec![event(1, 1, "x"), event(2, 1, "x"), event(3, -1, "x")],
            complete_tag: None,
            started_at_ms: 0,
            finished_at_ms: None,
        };
        let materialized = materialize(&result).unwrap();
        assert_eq!(materialized.cols, vec!["value".to_string()]);
        assert_eq!(materialized.rows, vec![vec![json!("x")]]);
    }

    #[test]
    fn missing_diff_column_is_an_error() {
        let cols = vec!["value".to_string()];
        let rows = vec![vec![json!("x")]];
        assert!(matches!(
            merge_row_updates(&cols, &rows),
            Err(DiffError::MissingDiffColumn)
        ));
    }

    #[test]
    fn width_mismatch_is_an_error() {
        let rows = vec![vec![json!(1), json!(false), json!(1)]];
        assert!(matches!(
            merge_row_updates(&subscribe_cols(), &rows),
            Err(DiffError::RowWidthMismatch { index: 0, .. })
        ));
    }
}
