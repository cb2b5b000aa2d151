//! Shared helpers for integration tests: in-memory workbook construction
//! and a small three-sheet configuration.
#![allow(dead_code)] // not every test binary uses every helper

use std::io::{Cursor, Write};

use multisheet_migration::config::MigrationConfig;

/// Build an xlsx container from (sheet name, rows) pairs using inline
/// strings. The first row of each sheet is the header row.
pub fn build_workbook(sheets: &[(&str, Vec<Vec<&str>>)]) -> Vec<u8> {
    build_workbook_with_dimensions(
        &sheets
            .iter()
            .map(|(name, rows)| (*name, rows.clone(), None))
            .collect::<Vec<_>>(),
    )
}

/// Same, with an optional explicit dimension reference per sheet.
pub fn build_workbook_with_dimensions(
    sheets: &[(&str, Vec<Vec<&str>>, Option<&str>)],
) -> Vec<u8> {
    let mut zw = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = zip::write::FileOptions::default();

    let mut workbook = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
    );
    let mut rels = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (i, (name, _, _)) in sheets.iter().enumerate() {
        let n = i + 1;
        workbook.push_str(&format!(
            r#"<sheet name="{name}" sheetId="{n}" r:id="rId{n}"/>"#
        ));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
        ));
    }
    workbook.push_str("</sheets></workbook>");
    rels.push_str("</Relationships>");

    zw.start_file("xl/workbook.xml", opts).unwrap();
    zw.write_all(workbook.as_bytes()).unwrap();
    zw.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
    zw.write_all(rels.as_bytes()).unwrap();

    for (i, (_, rows, dimension)) in sheets.iter().enumerate() {
        let mut body = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
        );
        if let Some(d) = dimension {
            body.push_str(&format!(r#"<dimension ref="{d}"/>"#));
        }
        body.push_str("<sheetData>");
        for (r, row) in rows.iter().enumerate() {
            let row_num = r + 1;
            body.push_str(&format!(r#"<row r="{row_num}">"#));
            for (c, value) in row.iter().enumerate() {
                let cell_ref = format!("{}{row_num}", col_letter(c));
                if value.is_empty() {
                    body.push_str(&format!(r#"<c r="{cell_ref}"/>"#));
                } else {
                    body.push_str(&format!(
                        r#"<c r="{cell_ref}" t="inlineStr"><is><t>{value}</t></is></c>"#
                    ));
                }
            }
            body.push_str("</row>");
        }
        body.push_str("</sheetData></worksheet>");
        zw.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), opts)
            .unwrap();
        zw.write_all(body.as_bytes()).unwrap();
    }

    zw.finish().unwrap().into_inner()
}

fn col_letter(mut idx: usize) -> String {
    let mut s = String::new();
    loop {
        s.insert(0, (b'A' + (idx % 26) as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    s
}

/// Three sheet types mirroring the shipped default configuration, small
/// enough to reason about in tests.
pub fn test_config() -> MigrationConfig {
    MigrationConfig::from_yaml(
        r#"
upload:
  max_rows_per_sheet: 10000
rules:
  contract-required:
    type: required_field
    priority: 10
    fields: [contract_number, contract_type, org_code]
  contract-date:
    type: data_type
    priority: 30
    field: value_date
    data_type: date
  contract-unique-in-file:
    type: unique_in_file
    priority: 50
  customer-required:
    type: required_field
    priority: 10
    fields: [customer_code, customer_name]
  allocation-required:
    type: required_field
    priority: 10
    fields: [org_code, party_code, period_month, product_code]
sheet_types:
  - name: Contracts
    order: 1
    parallel: true
    raw_table: stg_contract_raw
    valid_table: stg_contract_valid
    error_table: stg_contract_error
    master_table: mst_contract
    columns:
      - { header: "Contract Number", column: contract_number, kind: text }
      - { header: "Contract Type", column: contract_type, kind: text }
      - { header: "Customer Code", column: customer_code, kind: text }
      - { header: "Value Date", column: value_date, kind: date }
      - { header: "Org Code", column: org_code, kind: text }
    rules: [contract-required, contract-date, contract-unique-in-file]
    business_key:
      discriminator: contract_type
      cases:
        - { when: [LOAN], parts: [contract_number, contract_type, value_date] }
        - { when: [CARD], parts: [contract_number, contract_type, customer_code] }
      default: { parts: [contract_number, contract_type] }
  - name: Customers
    order: 2
    parallel: true
    raw_table: stg_customer_raw
    valid_table: stg_customer_valid
    error_table: stg_customer_error
    master_table: mst_customer
    columns:
      - { header: "Customer Code", column: customer_code, kind: text }
      - { header: "Customer Name", column: customer_name, kind: text }
      - { header: "Open Date", column: value_date, kind: date }
    rules: [customer-required]
    business_key:
      default: { parts: [customer_code, value_date] }
  - name: Allocations
    order: 3
    parallel: true
    raw_table: stg_allocation_raw
    valid_table: stg_allocation_valid
    error_table: stg_allocation_error
    master_table: mst_allocation
    columns:
      - { header: "Org Code", column: org_code, kind: text }
      - { header: "Party Code", column: party_code, kind: text }
      - { header: "Period", column: period_month, kind: month }
      - { header: "Product Code", column: product_code, kind: text }
    rules: [allocation-required]
    business_key:
      default: { parts: [org_code, party_code, period_month, product_code] }
"#,
    )
    .unwrap()
}

pub const CONTRACT_HEADERS: [&str; 5] = [
    "Contract Number",
    "Contract Type",
    "Customer Code",
    "Value Date",
    "Org Code",
];

pub const CUSTOMER_HEADERS: [&str; 3] = ["Customer Code", "Customer Name", "Open Date"];

pub const ALLOCATION_HEADERS: [&str; 4] = ["Org Code", "Party Code", "Period", "Product Code"];
