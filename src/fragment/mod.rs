//! Fragment parsing: thin wrapper over sqlparser's MsSqlDialect.
//!
//! The analysis engine consumes the parser through a single contract:
//! `parse(text)` returns the statement list plus a (possibly empty) error
//! list. Any non-empty error list means "cannot analyze" — the engine does
//! not attempt partial recovery.
//!
//! This module also carries the two places where structured parsing cannot
//! reach and a character-level scan is used instead: extracting a procedure
//! body from its `CREATE PROCEDURE ... AS` header, and splitting raw text
//! into statement-sized windows for the `FOR JSON` fallback scan.

use sqlparser::ast::Statement;
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;

/// Result of parsing a SQL fragment
#[derive(Debug)]
pub struct ParsedFragment {
    pub statements: Vec<Statement>,
    /// Parser error messages; non-empty means the fragment is unusable
    pub errors: Vec<String>,
}

impl ParsedFragment {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parse SQL text into statements, collecting parser errors instead of
/// propagating them.
pub fn parse(sql: &str) -> ParsedFragment {
    let dialect = MsSqlDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => ParsedFragment {
            statements,
            errors: Vec::new(),
        },
        Err(err) => ParsedFragment {
            statements: Vec::new(),
            errors: vec![err.to_string()],
        },
    }
}

/// Lightweight character scanner state shared by the body extractor and the
/// statement splitter. Tracks strings, bracketed identifiers, comments and
/// parenthesis depth.
struct ScanState {
    in_string: bool,
    in_bracket: bool,
    in_line_comment: bool,
    in_block_comment: bool,
    paren_depth: i32,
}

impl ScanState {
    fn new() -> Self {
        Self {
            in_string: false,
            in_bracket: false,
            in_line_comment: false,
            in_block_comment: false,
            paren_depth: 0,
        }
    }

    /// Advance over one byte; returns true when the byte is plain code
    /// (outside strings/brackets/comments).
    fn step(&mut self, bytes: &[u8], i: usize) -> bool {
        let b = bytes[i];
        if self.in_line_comment {
            if b == b'\n' {
                self.in_line_comment = false;
            }
            return false;
        }
        if self.in_block_comment {
            if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                self.in_block_comment = false;
            }
            return false;
        }
        if self.in_string {
            // Doubled quote is an escaped quote; the second one re-enters
            // string state on its own step
            if b == b'\'' {
                self.in_string = false;
            }
            return false;
        }
        if self.in_bracket {
            if b == b']' {
                self.in_bracket = false;
            }
            return false;
        }
        match b {
            b'\'' => {
                self.in_string = true;
                false
            }
            b'[' => {
                self.in_bracket = true;
                false
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                self.in_line_comment = true;
                false
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                self.in_block_comment = true;
                false
            }
            b'(' => {
                self.paren_depth += 1;
                true
            }
            b')' => {
                self.paren_depth -= 1;
                true
            }
            _ => true,
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'@' || b == b'#'
}

/// True when the word ending just before `i` is a `@parameter` name, in which
/// case an `AS` here separates the parameter from its type, not header from
/// body (`@Mode AS VARCHAR(10)`).
fn follows_parameter_name(bytes: &[u8], mut i: usize) -> bool {
    while i > 0 && bytes[i - 1].is_ascii_whitespace() {
        i -= 1;
    }
    let end = i;
    while i > 0 && is_word_byte(bytes[i - 1]) {
        i -= 1;
    }
    i < end && bytes[i] == b'@'
}

/// Extract the body of a `CREATE [OR ALTER] PROCEDURE ... AS <body>`
/// definition. Returns the input unchanged when it does not start with a
/// procedure header (the text is then assumed to already be a body).
///
/// The `AS` keyword is located at parenthesis depth zero, outside strings,
/// brackets and comments, so parameter defaults like `@p INT = 'AS'` do not
/// confuse it.
pub fn extract_procedure_body(definition: &str) -> &str {
    let trimmed = definition.trim_start();
    let lower = trimmed.get(..16).unwrap_or(trimmed).to_ascii_lowercase();
    if !lower.starts_with("create") && !lower.starts_with("alter") {
        return definition;
    }

    let bytes = definition.as_bytes();
    let mut state = ScanState::new();
    let mut i = 0;
    while i < bytes.len() {
        let plain = state.step(bytes, i);
        if plain
            && state.paren_depth == 0
            && (bytes[i] == b'a' || bytes[i] == b'A')
            && bytes.get(i + 1).is_some_and(|b| *b == b's' || *b == b'S')
        {
            let before_ok = i == 0 || !is_word_byte(bytes[i - 1]);
            let after_ok = bytes.get(i + 2).is_none_or(|b| !is_word_byte(*b));
            if before_ok && after_ok && !follows_parameter_name(bytes, i) {
                return &definition[i + 2..];
            }
        }
        i += 1;
    }
    definition
}

/// Find `needle` at parenthesis depth zero, outside strings, brackets and
/// comments. Used to distinguish a statement's own clauses from anything
/// nested in a subquery.
pub fn find_top_level_ci(sql: &str, needle: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let needle_bytes = needle.as_bytes();
    if needle_bytes.is_empty() {
        return None;
    }
    let mut state = ScanState::new();
    let mut i = 0;
    while i < bytes.len() {
        let plain = state.step(bytes, i);
        if plain
            && state.paren_depth == 0
            && i + needle_bytes.len() <= bytes.len()
            && bytes[i..i + needle_bytes.len()].eq_ignore_ascii_case(needle_bytes)
        {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Split raw SQL text into statement-sized windows at top-level semicolons.
/// Used only by the raw-text `FOR JSON` fallback; statements without
/// semicolon separators come back as one window.
pub fn split_statement_windows(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut state = ScanState::new();
    let mut windows = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let plain = state.step(bytes, i);
        if plain && state.paren_depth == 0 && bytes[i] == b';' {
            windows.push(&sql[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    if start < sql.len() {
        windows.push(&sql[start..]);
    }
    windows.retain(|w| !w.trim().is_empty());
    windows
}
