//! Pre-save validator scenarios: structure, dimension caps, payload bounds
//! and the advisory template check.

mod common;

use common::{build_workbook, build_workbook_with_dimensions, test_config};
use multisheet_migration::upload::{validate_workbook, UploadFaultKind};

fn headers_row<'a>(headers: &'a [&'a str]) -> Vec<&'a str> {
    headers.to_vec()
}

fn full_workbook() -> Vec<u8> {
    build_workbook(&[
        (
            "Contracts",
            vec![
                headers_row(&common::CONTRACT_HEADERS),
                vec!["HD-1", "LOAN", "KH-1", "2024-01-15", "ORG1"],
            ],
        ),
        (
            "Customers",
            vec![
                headers_row(&common::CUSTOMER_HEADERS),
                vec!["KH-1", "First Customer", "2024-01-02"],
            ],
        ),
        (
            "Allocations",
            vec![
                headers_row(&common::ALLOCATION_HEADERS),
                vec!["ORG1", "P-1", "2024-01", "PROD-9"],
            ],
        ),
    ])
}

#[test]
fn complete_workbook_passes() {
    let config = test_config();
    let report = validate_workbook(&config, "upload.xlsx", &full_workbook());
    assert!(report.ok, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.row_counts["Contracts"], 1);
    assert_eq!(report.row_counts["Customers"], 1);
    assert_eq!(report.row_counts["Allocations"], 1);
}

#[test]
fn empty_payload_is_rejected() {
    let config = test_config();
    let report = validate_workbook(&config, "upload.xlsx", &[]);
    assert!(!report.ok);
    assert_eq!(report.errors[0].kind, UploadFaultKind::OversizePayload);
}

#[test]
fn oversize_payload_is_rejected() {
    let mut config = test_config();
    config.upload.max_payload_bytes = 16;
    let report = validate_workbook(&config, "upload.xlsx", &full_workbook());
    assert!(!report.ok);
    assert_eq!(report.errors[0].kind, UploadFaultKind::OversizePayload);
}

#[test]
fn wrong_extension_is_rejected() {
    let config = test_config();
    let report = validate_workbook(&config, "upload.csv", &full_workbook());
    assert!(!report.ok);
    assert_eq!(report.errors[0].kind, UploadFaultKind::BadExtension);
}

#[test]
fn garbage_container_is_invalid_workbook() {
    let config = test_config();
    let report = validate_workbook(&config, "upload.xlsx", b"definitely not a zip");
    assert!(!report.ok);
    assert_eq!(report.errors[0].kind, UploadFaultKind::InvalidWorkbook);
}

#[test]
fn missing_sheet_lists_expected_and_found() {
    let config = test_config();
    let bytes = build_workbook(&[(
        "Contracts",
        vec![headers_row(&common::CONTRACT_HEADERS)],
    )]);
    let report = validate_workbook(&config, "upload.xlsx", &bytes);
    assert!(!report.ok);
    let fault = &report.errors[0];
    assert_eq!(fault.kind, UploadFaultKind::MissingSheet);
    assert!(fault.message.contains("Customers"));
    assert!(fault.message.contains("Allocations"));
    assert!(fault.message.contains("Contracts"));
}

#[test]
fn declared_dimension_over_cap_is_rejected_without_reading_rows() {
    let config = test_config();
    // The sheet declares 15000 rows but carries only its header; the
    // validator must trust the dimension reference.
    let bytes = build_workbook_with_dimensions(&[
        (
            "Contracts",
            vec![headers_row(&common::CONTRACT_HEADERS)],
            Some("A1:Z15000"),
        ),
        (
            "Customers",
            vec![headers_row(&common::CUSTOMER_HEADERS)],
            None,
        ),
        (
            "Allocations",
            vec![headers_row(&common::ALLOCATION_HEADERS)],
            None,
        ),
    ]);
    let report = validate_workbook(&config, "upload.xlsx", &bytes);
    assert!(!report.ok);
    let fault = report
        .errors
        .iter()
        .find(|e| e.kind == UploadFaultKind::ExcessiveRows)
        .expect("excessive-rows fault");
    assert!(fault.message.contains("14999"));
}

#[test]
fn zero_cap_disables_the_row_limit() {
    let mut config = test_config();
    config.upload.max_rows_per_sheet = 0;
    let bytes = build_workbook_with_dimensions(&[
        (
            "Contracts",
            vec![headers_row(&common::CONTRACT_HEADERS)],
            Some("A1:Z1000000"),
        ),
        (
            "Customers",
            vec![headers_row(&common::CUSTOMER_HEADERS)],
            None,
        ),
        (
            "Allocations",
            vec![headers_row(&common::ALLOCATION_HEADERS)],
            None,
        ),
    ]);
    let report = validate_workbook(&config, "upload.xlsx", &bytes);
    assert!(report.ok, "unexpected errors: {:?}", report.errors);
}

#[test]
fn header_mismatch_is_a_warning_not_an_error() {
    let config = test_config();
    let bytes = build_workbook(&[
        (
            "Contracts",
            vec![vec!["Contract Number", "Mystery Column"]],
        ),
        (
            "Customers",
            vec![headers_row(&common::CUSTOMER_HEADERS)],
        ),
        (
            "Allocations",
            vec![headers_row(&common::ALLOCATION_HEADERS)],
        ),
    ]);
    let report = validate_workbook(&config, "upload.xlsx", &bytes);
    assert!(report.ok, "template mismatch must not block: {:?}", report.errors);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("Contract Type")));
}

#[test]
fn extra_sheets_are_warned_and_ignored() {
    let config = test_config();
    let bytes = build_workbook(&[
        (
            "Contracts",
            vec![headers_row(&common::CONTRACT_HEADERS)],
        ),
        (
            "Customers",
            vec![headers_row(&common::CUSTOMER_HEADERS)],
        ),
        (
            "Allocations",
            vec![headers_row(&common::ALLOCATION_HEADERS)],
        ),
        ("Scratch", vec![vec!["whatever"]]),
    ]);
    let report = validate_workbook(&config, "upload.xlsx", &bytes);
    assert!(report.ok);
    assert!(report.warnings.iter().any(|w| w.contains("Scratch")));
}
