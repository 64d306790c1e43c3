//! Point-read queries against the data provider.
//!
//! Used for initial load, resync after a gap, feed pagination, and the
//! occasional single-row hydration. Writes go through the provider's
//! `insert`/`update`/`delete` calls directly and need no query type.

use serde::{Deserialize, Serialize};

use crate::scope::{Predicate, Scope, Table};

/// Sort order for a select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column to sort on.
    pub column: String,
    /// True for descending order.
    pub descending: bool,
}

impl OrderBy {
    /// Ascending order on `column`.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Descending order on `column`.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// A half-open row window `[offset, offset + limit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    /// First row index.
    pub offset: usize,
    /// Maximum number of rows returned.
    pub limit: usize,
}

impl PageRange {
    /// Build a window.
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// One past the last row index.
    pub const fn end(&self) -> usize {
        self.offset + self.limit
    }
}

/// A point-read request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    /// Table to read.
    pub table: Table,
    /// Row filter.
    pub predicate: Predicate,
    /// Optional sort order.
    pub order: Option<OrderBy>,
    /// Optional row window.
    pub range: Option<PageRange>,
}

impl SelectQuery {
    /// Read every row of a table (subject to provider session scoping).
    pub fn table(table: Table) -> Self {
        Self {
            table,
            predicate: Predicate::All,
            order: None,
            range: None,
        }
    }

    /// Read the rows a scope covers.
    pub fn scope(scope: &Scope) -> Self {
        Self {
            table: scope.table,
            predicate: scope.predicate.clone(),
            order: None,
            range: None,
        }
    }

    /// Restrict to rows matching an equality filter.
    pub fn filter(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.predicate = Predicate::eq(column, value);
        self
    }

    /// Sort the result.
    pub fn order(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    /// Return only the given window.
    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.range = Some(PageRange::new(offset, limit));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChatId;

    #[test]
    fn builder_composes() {
        let chat = ChatId::new();
        let query = SelectQuery::table(Table::Messages)
            .filter("chat_id", chat)
            .order(OrderBy::asc("created_at"))
            .range(0, 50);

        assert_eq!(query.table, Table::Messages);
        assert_eq!(query.predicate, Predicate::eq("chat_id", chat));
        assert_eq!(query.order, Some(OrderBy::asc("created_at")));
        assert_eq!(query.range, Some(PageRange::new(0, 50)));
        assert_eq!(query.range.unwrap().end(), 50);
    }

    #[test]
    fn scope_query_reuses_the_scope_filter() {
        let scope = Scope::feed();
        let query = SelectQuery::scope(&scope);
        assert_eq!(query.table, Table::Posts);
        assert_eq!(query.predicate, Predicate::All);
    }
}
