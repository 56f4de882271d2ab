//! Search query and result types.

use crate::traits::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-field predicate applied by the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldFilter {
    Eq(String, Value),
    Ne(String, Value),
    Exists(String),
    NotExists(String),
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Structured query handed to `SearchIndex::search`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free-form query string matched against string fields.
    pub text: Option<String>,
    pub filters: Vec<FieldFilter>,
    /// 1-based page number; 0 is normalized to 1.
    pub page: usize,
    pub limit: usize,
    /// Explicit ordering; time-series indexes default to descending
    /// `updated_at` when unset.
    pub sort: Option<(String, SortOrder)>,
    /// Aggregation definitions passed through to the backend unmodified.
    pub aggregations: Option<Value>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self {
            page: 1,
            limit: 20,
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        self.sort = Some((field.to_string(), order));
        self
    }
}

/// Page of search hits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub list: Vec<Record>,
    /// Total matches before paging.
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    /// Backend-reported query time in milliseconds.
    pub took: u64,
    pub aggregations: Option<Value>,
}

// ============================================================================
// TESTS
// ============================================================================
