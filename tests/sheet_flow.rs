//! Stream -> map -> validate flow over real workbook bytes, no database.
//!
//! Exercises the pipeline's data path: rows come out of the streamer, the
//! mapper normalizes them, the engine partitions them. DB-backed rules are
//! fed empty lookup results, as a fresh database would.

mod common;

use common::{build_workbook, test_config};
use multisheet_migration::mapping::{RawRecord, RowMapper};
use multisheet_migration::validation::{
    ErrorKind, JobValidationContext, RowOutcome, ValidationEngine,
};
use workbook_stream::XlsxWorkbook;

/// Ingest one sheet the way the pipeline does: header row first, then data
/// rows mapped with 1-based row numbers.
fn ingest_sheet(bytes: Vec<u8>, sheet_name: &str) -> Vec<RawRecord> {
    let config = test_config();
    let sheet = config.sheet(sheet_name).unwrap();
    let mut workbook = XlsxWorkbook::from_bytes(bytes).unwrap();
    let mut rows = workbook.rows(sheet_name).unwrap();
    let (_, headers) = rows.next_row().unwrap().expect("header row");
    let mapper = RowMapper::from_header_row(sheet, &headers);

    let mut records = Vec::new();
    while let Some((idx, cells)) = rows.next_row().unwrap() {
        records.push(mapper.map_row("JOB-20240101-001", idx as i64, &cells));
    }
    records
}

fn validate(records: &[RawRecord], sheet_name: &str) -> Vec<RowOutcome> {
    let config = test_config();
    let sheet = config.sheet(sheet_name).unwrap();
    let engine = ValidationEngine::for_sheet(&config, sheet).unwrap();
    let mut ctx = JobValidationContext::new();
    for spec in engine.lookup_specs(records) {
        ctx.set_existing(&spec.rule_id, Default::default());
    }
    engine.validate_batch(records, &mut ctx)
}

#[test]
fn happy_path_rows_all_validate() {
    let bytes = build_workbook(&[(
        "Contracts",
        vec![
            common::CONTRACT_HEADERS.to_vec(),
            vec!["HD-1", "LOAN", "KH-1", "15/01/2024", "ORG1"],
            vec!["HD-2", "CARD", "KH-2", "2024-02-20", "ORG1"],
            vec!["HD-3", "DEPOSIT", "KH-3", "2024-03-25", "ORG2"],
        ],
    )]);
    let records = ingest_sheet(bytes, "Contracts");
    assert_eq!(records.len(), 3);
    // Dates normalized to ISO regardless of source pattern.
    assert_eq!(records[0].value("value_date"), Some("2024-01-15"));
    // Conditional business keys per discriminator class.
    assert_eq!(records[0].business_key, "HD-1_LOAN_2024-01-15");
    assert_eq!(records[1].business_key, "HD-2_CARD_KH-2");
    assert_eq!(records[2].business_key, "HD-3_DEPOSIT");

    let outcomes = validate(&records, "Contracts");
    assert!(outcomes.iter().all(RowOutcome::is_valid));
}

#[test]
fn rows_missing_a_required_field_all_become_errors() {
    // Five data rows, each without an org code.
    let mut rows = vec![common::CONTRACT_HEADERS.to_vec()];
    for i in 1..=5 {
        rows.push(match i {
            1 => vec!["HD-1", "LOAN", "KH-1", "2024-01-15", ""],
            2 => vec!["HD-2", "LOAN", "KH-2", "2024-01-15", ""],
            3 => vec!["HD-3", "LOAN", "KH-3", "2024-01-15", ""],
            4 => vec!["HD-4", "LOAN", "KH-4", "2024-01-15", ""],
            _ => vec!["HD-5", "LOAN", "KH-5", "2024-01-15", ""],
        });
    }
    let bytes = build_workbook(&[("Contracts", rows)]);
    let records = ingest_sheet(bytes, "Contracts");
    assert_eq!(records.len(), 5);

    let outcomes = validate(&records, "Contracts");
    assert!(outcomes.iter().all(|o| !o.is_valid()));
    for outcome in &outcomes {
        let error = &outcome.errors[0];
        assert_eq!(error.kind, ErrorKind::RequiredMissing);
        assert_eq!(error.field, "org_code");
        assert_eq!(error.rule_id, "contract-required");
    }
}

#[test]
fn duplicate_in_file_keeps_first_flags_second() {
    // Rows 3 and 7 agree on contract number, type and date: same business
    // key. The earlier one stays valid.
    let bytes = build_workbook(&[(
        "Contracts",
        vec![
            common::CONTRACT_HEADERS.to_vec(),
            vec!["HD-A", "LOAN", "KH-1", "2024-01-01", "ORG1"], // row 1
            vec!["HD-B", "LOAN", "KH-1", "2024-01-02", "ORG1"],
            vec!["HD-C", "LOAN", "KH-1", "2024-01-03", "ORG1"], // row 3
            vec!["HD-D", "LOAN", "KH-1", "2024-01-04", "ORG1"],
            vec!["HD-E", "LOAN", "KH-1", "2024-01-05", "ORG1"],
            vec!["HD-F", "LOAN", "KH-1", "2024-01-06", "ORG1"],
            vec!["HD-C", "LOAN", "KH-9", "2024-01-03", "ORG2"], // row 7: same key as row 3
            vec!["HD-H", "LOAN", "KH-1", "2024-01-08", "ORG1"],
            vec!["HD-I", "LOAN", "KH-1", "2024-01-09", "ORG1"],
            vec!["HD-J", "LOAN", "KH-1", "2024-01-10", "ORG1"],
        ],
    )]);
    let records = ingest_sheet(bytes, "Contracts");
    assert_eq!(records.len(), 10);

    let outcomes = validate(&records, "Contracts");
    let (valid, errors): (Vec<_>, Vec<_>) = outcomes.iter().partition(|o| o.is_valid());
    assert_eq!(valid.len(), 9);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].row_number, 7);
    assert_eq!(errors[0].errors[0].kind, ErrorKind::DupInFile);
}

#[test]
fn blank_rows_are_ingested_and_fail_validation() {
    let bytes = build_workbook(&[(
        "Contracts",
        vec![
            common::CONTRACT_HEADERS.to_vec(),
            vec!["", "", "", "", ""],
        ],
    )]);
    let records = ingest_sheet(bytes, "Contracts");
    assert_eq!(records.len(), 1);
    assert!(records[0].values.values().all(Option::is_none));

    let outcomes = validate(&records, "Contracts");
    assert!(!outcomes[0].is_valid());
}

#[test]
fn month_sheet_normalizes_periods() {
    let bytes = build_workbook(&[(
        "Allocations",
        vec![
            common::ALLOCATION_HEADERS.to_vec(),
            vec!["ORG1", "P-1", "7/2024", "PROD-1"],
            vec!["ORG1", "P-2", "2024-11", "PROD-2"],
        ],
    )]);
    let records = ingest_sheet(bytes, "Allocations");
    assert_eq!(records[0].value("period_month"), Some("2024-07"));
    assert_eq!(records[1].value("period_month"), Some("2024-11"));
    assert_eq!(records[0].business_key, "ORG1_P-1_2024-07_PROD-1");
}

#[test]
fn partition_is_deterministic_across_runs() {
    let bytes = build_workbook(&[(
        "Contracts",
        vec![
            common::CONTRACT_HEADERS.to_vec(),
            vec!["HD-1", "LOAN", "KH-1", "2024-01-15", "ORG1"],
            vec!["HD-1", "LOAN", "KH-1", "2024-01-15", "ORG1"],
            vec!["HD-2", "LOAN", "KH-1", "bad date", "ORG1"],
        ],
    )]);
    let first_records = ingest_sheet(bytes.clone(), "Contracts");
    let second_records = ingest_sheet(bytes, "Contracts");

    let verdicts = |records: &[RawRecord]| {
        validate(records, "Contracts")
            .iter()
            .map(RowOutcome::is_valid)
            .collect::<Vec<_>>()
    };
    assert_eq!(verdicts(&first_records), verdicts(&second_records));
    assert_eq!(verdicts(&first_records), vec![true, false, false]);
}
