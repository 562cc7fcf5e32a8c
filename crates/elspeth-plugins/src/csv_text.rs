// elspeth-plugins/src/csv_text.rs
// ============================================================================
// Module: CSV Text Handling
// Description: Minimal RFC 4180 line parsing and formatting.
// Purpose: Shared quoting rules for the CSV source and sink.
// Dependencies: none
// ============================================================================

//! ## Overview
//! The CSV surface ELSPETH needs is small and fully specified: a configurable
//! single-character delimiter, double-quote quoting with embedded-quote
//! doubling, and UTF-8 text. Both the source and the sink go through these
//! two functions so quoting stays symmetric.

// ============================================================================
// SECTION: Parsing
// ============================================================================

/// Splits one CSV record into fields under RFC 4180 quoting.
#[must_use]
pub fn parse_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else if ch == '"' {
            in_quotes = true;
        } else if ch == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    fields.push(current);
    fields
}

// ============================================================================
// SECTION: Formatting
// ============================================================================

/// Joins fields into one CSV record, quoting only where required.
#[must_use]
pub fn format_line(fields: &[String], delimiter: char) -> String {
    let cells: Vec<String> =
        fields.iter().map(|field| quote_field(field, delimiter)).collect();
    cells.join(&delimiter.to_string())
}

/// Quotes a field when it contains the delimiter, quotes, or newlines.
fn quote_field(field: &str, delimiter: char) -> String {
    if field.contains(delimiter) || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
