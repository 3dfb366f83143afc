#![forbid(unsafe_code)]

//! End-to-end conversion pipeline: CSV in, rule config applied, JSON
//! records out. The member crates do the real work; this crate wires
//! ingestion, text derivation, derived fields, row filtering, and
//! visibility projection together and re-exports the public surface.

use serde_json::Value;
use sv_config::{apply_derived_fields, apply_text_fields, row_passes_filter, visible_columns};
use sv_io::{IoError, row_to_json};
use thiserror::Error;

pub use sv_config::{
    ColumnSpec, ConfigError, ConversionConfig, DerivedField, TextField, TextOperation,
    VisibilityRule, generate_default_config,
};
pub use sv_expr::{
    CompareOp, Condition, ConditionError, Diagnostic, DiagnosticKind, DiagnosticLog,
    MAX_CONDITION_DEPTH, RegexMatcher,
};
pub use sv_io::{Table, read_csv_path, read_csv_str};
pub use sv_types::{CellValue, ColumnType, Row};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// The result of one conversion run. Diagnostics are the folded per-row
/// logs; they report config/data mismatches without having affected any
/// filtering outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutput {
    pub records: Value,
    pub rows_read: usize,
    pub rows_emitted: usize,
    pub diagnostics: DiagnosticLog,
}

/// Build a config straight from a parsed table: inferred column types,
/// everything visible, no rules. The starting point users edit.
#[must_use]
pub fn default_config_for(table: &Table) -> ConversionConfig {
    let columns = table
        .headers()
        .iter()
        .zip(table.column_types())
        .map(|(name, column_type)| ColumnSpec {
            name: name.clone(),
            column_type: *column_type,
            visible: true,
        })
        .collect();
    ConversionConfig {
        columns,
        ..ConversionConfig::default()
    }
}

pub fn convert_table(
    table: &Table,
    config: &ConversionConfig,
) -> Result<ConversionOutput, PipelineError> {
    let mut records = Vec::new();
    let mut diagnostics = DiagnosticLog::new();

    for row in table.rows() {
        let mut row = row.clone();
        let mut log = DiagnosticLog::new();

        apply_text_fields(config, &mut row, &mut log);
        apply_derived_fields(config, &mut row, &mut log)?;

        if row_passes_filter(config, &row, &mut log)? {
            let columns = visible_columns(config, &row, &mut log)?;
            records.push(row_to_json(&row, &columns));
        }
        diagnostics.merge(log);
    }

    Ok(ConversionOutput {
        rows_read: table.len(),
        rows_emitted: records.len(),
        records: Value::Array(records),
        diagnostics,
    })
}

pub fn convert_str(
    csv_text: &str,
    config: &ConversionConfig,
) -> Result<ConversionOutput, PipelineError> {
    let table = sv_io::read_csv_str(csv_text)?;
    convert_table(&table, config)
}

#[cfg(test)]
mod tests {
    use sv_types::ColumnType;

    use super::{default_config_for, read_csv_str};

    #[test]
    fn default_config_mirrors_the_table_shape() {
        let table = read_csv_str("id,name\n1,a\n2,b\n").expect("read");
        let config = default_config_for(&table);

        assert_eq!(config.columns.len(), 2);
        assert_eq!(config.columns[0].name, "id");
        assert_eq!(config.columns[0].column_type, ColumnType::Integer);
        assert!(config.columns.iter().all(|spec| spec.visible));
        assert!(config.filter.is_none());
    }
}
