//! FTS5 query sanitization for the full-text candidate source.
//!
//! SQLite's FTS5 query syntax treats `"`, `(`, `)`, `*`, `:`, `-`, and `^` as
//! operators. User queries are free text, not FTS5 syntax, so every token is
//! quoted individually and joined with implicit AND before being handed to
//! `MATCH`.

/// Turn free text into a safe FTS5 `MATCH` expression: each token wrapped in
/// double quotes (FTS5 string literal), quotes inside the token escaped by
/// doubling, joined with spaces (implicit AND in FTS5 query syntax).
pub fn sanitize_fts5_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
