//! Cell reference arithmetic for A1-style addresses.

/// Zero-based column index from a cell reference such as `BC12`.
/// Returns `None` when the reference has no letter prefix.
pub(crate) fn column_index(cell_ref: &str) -> Option<u32> {
    let mut col: u32 = 0;
    let mut seen = false;
    for b in cell_ref.bytes() {
        if b.is_ascii_alphabetic() {
            seen = true;
            col = col * 26 + (b.to_ascii_uppercase() - b'A' + 1) as u32;
        } else {
            break;
        }
    }
    if seen {
        Some(col - 1)
    } else {
        None
    }
}

/// One-based row number from a cell reference such as `BC12`.
pub(crate) fn row_number(cell_ref: &str) -> Option<u32> {
    let digits: String = cell_ref
        .chars()
        .skip_while(|c| c.is_ascii_alphabetic())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Total row count declared by a dimension reference (`A1:Z10000` -> 10000).
/// A single-cell reference counts as one row.
pub(crate) fn dimension_rows(dimension_ref: &str) -> Option<u64> {
    let last = dimension_ref.rsplit(':').next()?;
    row_number(last).map(u64::from)
}
