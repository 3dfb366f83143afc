use serde_json::json;
use sievecsv::{
    CellValue, Condition, ConversionConfig, DiagnosticKind, DiagnosticLog, convert_str,
};

const INPUT: &str = "\
document,status,score,isActive
/data/reports/q1.csv,open,85,true
/data/reports/q2.tsv,CLOSED,40,true
/data/notes/memo.txt,Pending,90,false
/data/reports/q3.csv,pending,75,true
";

fn rules() -> ConversionConfig {
    let document = json!({
        "columns": {
            "document": {"type": "STRING"},
            "status": {"type": "STRING"},
            "score": {"type": "INTEGER", "visible": false},
            "isActive": {"type": "BOOLEAN"}
        },
        "textFields": [
            {"name": "extension", "source": "document", "operation": "GET_EXTENSION"},
            {"name": "basename", "source": "document", "operation": "GET_FILENAME",
             "visible": false}
        ],
        "derivedFields": [
            {"name": "isTabular",
             "condition": {"type": "STRING_IN_REGEXSET", "field": "document",
                           "patterns": ["\\.csv$", "\\.tsv$"]}},
            {"name": "actionable",
             "condition": {"type": "AND", "operands": [
                 {"type": "FIELD", "field": "isActive"},
                 {"type": "FIELD", "field": "isTabular"},
                 {"type": "STRING_IN_SET", "field": "status",
                  "values": ["OPEN", "PENDING"], "ignoreCase": true},
                 {"type": "FIELD", "field": "score", "comparison": ">=", "value": 50}
             ]}}
        ],
        "filter": {"type": "FIELD", "field": "actionable"}
    });
    ConversionConfig::from_json(&document).expect("config should decode")
}

#[test]
fn pipeline_filters_derives_and_projects() {
    let output = convert_str(INPUT, &rules()).expect("conversion should run");

    assert_eq!(output.rows_read, 4);
    assert_eq!(output.rows_emitted, 2);

    let records = output.records.as_array().expect("array");
    assert_eq!(
        serde_json::to_string(&records[0]).expect("serialize"),
        concat!(
            r#"{"document":"/data/reports/q1.csv","status":"open","isActive":true,"#,
            r#""isTabular":true,"actionable":true,"extension":"csv"}"#
        )
    );
    assert_eq!(records[1]["document"], "/data/reports/q3.csv");

    // Hidden columns stay out of every record.
    assert!(records.iter().all(|record| record.get("score").is_none()));
    assert!(records.iter().all(|record| record.get("basename").is_none()));
}

#[test]
fn clean_runs_emit_no_diagnostics() {
    let output = convert_str(INPUT, &rules()).expect("conversion should run");
    assert!(output.diagnostics.is_empty());
}

#[test]
fn rules_over_absent_columns_surface_as_diagnostics_not_errors() {
    let document = json!({
        "columns": {"a": {"type": "STRING"}},
        "filter": {"type": "FIELD", "field": "ghost"}
    });
    let config = ConversionConfig::from_json(&document).expect("config");

    let output = convert_str("a\nx\ny\n", &config).expect("conversion should run");
    assert_eq!(output.rows_emitted, 0);
    assert_eq!(output.diagnostics.records().len(), 2);
    assert!(
        output
            .diagnostics
            .records()
            .iter()
            .all(|record| record.kind == DiagnosticKind::FieldNotFound)
    );
}

#[test]
fn malformed_rule_documents_fail_before_any_row_is_read() {
    let document = json!({"filter": {"type": "XOR", "operands": []}});
    assert!(ConversionConfig::from_json(&document).is_err());
}

#[test]
fn status_match_or_count_field_short_circuits() {
    // Row {"status": "open", "count": 3}: the case-insensitive match on
    // status decides the Or before Field("count") is consulted, so the
    // numeric cell never produces a not-boolean diagnostic.
    let condition = Condition::from_json(&json!({
        "type": "OR",
        "operands": [
            {"type": "STRING_CASE_INSENSITIVE_MATCH", "field": "status", "value": "OPEN"},
            {"type": "FIELD", "field": "count"}
        ]
    }))
    .expect("condition");

    let row: sievecsv::Row = [
        ("status".to_owned(), CellValue::Utf8("open".to_owned())),
        ("count".to_owned(), CellValue::Int64(3)),
    ]
    .into_iter()
    .collect();

    let mut log = DiagnosticLog::new();
    assert!(condition.evaluate(&row, &mut log).expect("evaluate"));
    assert!(log.is_empty());
}
