//! Token-budgeted context assembly helpers (spec.md §4.5, §4.4).
//!
//! The local/global/naive query modes and the community-report generator
//! all converge on the same shape: build a CSV-like table of ranked rows,
//! then fit it to a token budget by shortening descriptions first and
//! dropping the lowest-ranked rows last. This module is that shared
//! machinery; the mode-specific row selection lives in the `graphrag` app
//! crate's query planner, which has access to the live stores.

use crate::chunk::{count_tokens, truncate_to_tokens};

/// A CSV-rendered table with an explicit "description" column that may be
/// shortened before rows are dropped entirely.
#[derive(Debug, Clone)]
pub struct CsvTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Index into `header`/each row holding the free-text description,
    /// if any — the first column shortened when a table is over budget.
    pub description_col: Option<usize>,
}

impl CsvTable {
    pub fn new(header: Vec<String>, description_col: Option<usize>) -> Self {
        Self { header, rows: Vec::new(), description_col }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.header.len(), "row arity must match header");
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.header.join(","));
        for row in &self.rows {
            out.push('\n');
            out.push_str(&row.iter().map(|cell| csv_escape(cell)).collect::<Vec<_>>().join(","));
        }
        out
    }

    pub fn token_len(&self) -> usize {
        count_tokens(&self.render())
    }

    /// Fit this table to `max_tokens` by: (1) shortening the description
    /// column of every row proportionally, then (2) dropping rows from
    /// the end (callers sort rows worst-ranked-last beforehand) until the
    /// rendered table is within budget (spec.md §4.4 step 4, §4.5 step 8).
    pub fn fit_to_budget(&mut self, max_tokens: usize) {
        if self.token_len() <= max_tokens || self.rows.is_empty() {
            return;
        }

        if let Some(col) = self.description_col {
            let mut shrink_to = 200usize;
            while self.token_len() > max_tokens && shrink_to > 10 {
                for row in &mut self.rows {
                    row[col] = truncate_to_tokens(&row[col], shrink_to);
                }
                shrink_to = shrink_to * 2 / 3;
            }
        }

        while self.token_len() > max_tokens && !self.rows.is_empty() {
            self.rows.pop();
        }
    }
}

fn csv_escape(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Join multiple already-rendered sections with the section-header
/// convention the query prompts use (`REPORTS`, `ENTITIES`,
/// `RELATIONSHIPS`, `SOURCES`), in the caller-supplied order. Sections
/// with no rows are omitted entirely.
pub fn assemble_sections(sections: &[(&str, &CsvTable)]) -> String {
    sections
        .iter()
        .filter(|(_, table)| !table.rows.is_empty())
        .map(|(name, table)| format!("-----{name}-----\n{}", table.render()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
