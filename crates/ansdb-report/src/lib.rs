//! Top-expense rankings over persisted financial statements.

mod export;
mod memory;
mod pg;

use std::fmt;

use ansdb_core::REPORT_KEYWORDS;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub use export::{export_reports, format_brl, render_markdown, ReportArtifacts, ReportManifest, ReportManifestFile};

pub const CRATE_NAME: &str = "ansdb-report";

/// Maximum rows in one ranking.
pub const TOP_N: usize = 10;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("expense query failed: {0}")]
    Query(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportScope {
    /// One `periodo` label, e.g. `1T2024`.
    Period(String),
    /// Every statement whose `data` falls in the calendar year.
    Year(i32),
}

impl fmt::Display for ReportScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportScope::Period(label) => write!(f, "period {label}"),
            ReportScope::Year(year) => write!(f, "year {year}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    LatestPeriod,
    LatestYear,
}

/// Which query produced a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Keyword-filtered on `descricao`.
    Filtered,
    /// Fallback without the keyword filter.
    Unfiltered,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Filtered => "filtered",
            Tier::Unfiltered => "unfiltered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpenseRow {
    /// Operator `razao_social`; `None` when the operator has no name.
    pub display_name: Option<String>,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopExpenses {
    pub scope: ReportScope,
    pub tier: Tier,
    pub rows: Vec<ExpenseRow>,
}

/// Most recent statement row by `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestStatement {
    pub periodo: String,
    pub data: NaiveDate,
}

/// Read side of the statement store used by rankings.
#[async_trait]
pub trait ExpenseSource: Send + Sync {
    async fn latest_statement(&self) -> Result<Option<LatestStatement>, ReportError>;

    /// Sum of `valor` per operator name within `scope`, descending by total
    /// then ascending by name, at most `limit` groups. `keywords` restricts
    /// rows to those whose `descricao` contains any of them, ignoring case.
    async fn grouped_expenses(
        &self,
        scope: &ReportScope,
        keywords: Option<&[&str]>,
        limit: usize,
    ) -> Result<Vec<ExpenseRow>, ReportError>;
}

/// Ordering shared by every [`ExpenseSource`]: total descending, name
/// ascending with unnamed groups last.
pub(crate) fn rank(rows: &mut Vec<ExpenseRow>, limit: usize) {
    rows.sort_by(|a, b| {
        b.total
            .cmp(&a.total)
            .then_with(|| match (&a.display_name, &b.display_name) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
    });
    rows.truncate(limit);
}

pub struct AggregationEngine<'s, S: ?Sized> {
    source: &'s S,
}

impl<'s, S: ExpenseSource + ?Sized> AggregationEngine<'s, S> {
    pub fn new(source: &'s S) -> Self {
        Self { source }
    }

    /// Scope of the most recent statement, or `None` for an empty store.
    pub async fn latest_scope(&self, mode: ScopeMode) -> Result<Option<ReportScope>, ReportError> {
        let latest = self.source.latest_statement().await?;
        Ok(latest.map(|row| match mode {
            ScopeMode::LatestPeriod => ReportScope::Period(row.periodo),
            ScopeMode::LatestYear => ReportScope::Year(row.data.year()),
        }))
    }

    /// Keyword-filtered ranking; the unfiltered query runs only when the
    /// filtered one finds no groups.
    pub async fn top_expenses(&self, scope: ReportScope) -> Result<TopExpenses, ReportError> {
        let span = info_span!("top_expenses", scope = %scope);
        async {
            let filtered = self
                .source
                .grouped_expenses(&scope, Some(&REPORT_KEYWORDS), TOP_N)
                .await?;
            if !filtered.is_empty() {
                info!(groups = filtered.len(), tier = Tier::Filtered.as_str(), "ranking ready");
                return Ok(TopExpenses {
                    scope,
                    tier: Tier::Filtered,
                    rows: filtered,
                });
            }

            let rows = self.source.grouped_expenses(&scope, None, TOP_N).await?;
            info!(groups = rows.len(), tier = Tier::Unfiltered.as_str(), "ranking ready");
            Ok(TopExpenses {
                scope,
                tier: Tier::Unfiltered,
                rows,
            })
        }
        .instrument(span)
        .await
    }

    /// Rankings for the latest period and the latest year. Empty when there
    /// are no statements.
    pub async fn latest_reports(&self) -> Result<Vec<TopExpenses>, ReportError> {
        let mut reports = Vec::with_capacity(2);
        for mode in [ScopeMode::LatestPeriod, ScopeMode::LatestYear] {
            if let Some(scope) = self.latest_scope(mode).await? {
                reports.push(self.top_expenses(scope).await?);
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: Option<&str>, cents: i64) -> ExpenseRow {
        ExpenseRow {
            display_name: name.map(str::to_string),
            total: Decimal::new(cents, 2),
        }
    }

    #[test]
    fn ties_break_by_name_and_unnamed_sort_last() {
        let mut rows = vec![
            row(None, 500),
            row(Some("ZETA"), 500),
            row(Some("ALFA"), 500),
            row(Some("BETA"), 900),
        ];
        rank(&mut rows, 3);
        let names = rows.iter().map(|r| r.display_name.as_deref()).collect::<Vec<_>>();
        assert_eq!(names, vec![Some("BETA"), Some("ALFA"), Some("ZETA")]);
    }

    #[test]
    fn scope_labels_read_naturally() {
        assert_eq!(ReportScope::Period("1T2024".into()).to_string(), "period 1T2024");
        assert_eq!(ReportScope::Year(2023).to_string(), "year 2023");
    }
}
