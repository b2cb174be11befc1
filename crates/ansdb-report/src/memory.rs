use std::collections::HashMap;

use ansdb_core::contains_any_keyword;
use ansdb_sync::MemoryStore;
use async_trait::async_trait;
use chrono::Datelike;
use rust_decimal::Decimal;

use crate::{rank, ExpenseRow, ExpenseSource, LatestStatement, ReportError, ReportScope};

#[async_trait]
impl ExpenseSource for MemoryStore {
    async fn latest_statement(&self) -> Result<Option<LatestStatement>, ReportError> {
        let statements = self.statements().await;
        Ok(statements
            .into_iter()
            .max_by_key(|s| s.statement.data)
            .map(|s| LatestStatement {
                periodo: s.statement.periodo,
                data: s.statement.data,
            }))
    }

    async fn grouped_expenses(
        &self,
        scope: &ReportScope,
        keywords: Option<&[&str]>,
        limit: usize,
    ) -> Result<Vec<ExpenseRow>, ReportError> {
        let names = self
            .operators()
            .await
            .into_iter()
            .map(|op| (op.registro_ans, op.razao_social))
            .collect::<HashMap<_, _>>();

        let mut totals: HashMap<Option<String>, Decimal> = HashMap::new();
        for stored in self.statements().await {
            let s = &stored.statement;
            let in_scope = match scope {
                ReportScope::Period(label) => &s.periodo == label,
                ReportScope::Year(year) => s.data.year() == *year,
            };
            let matches = keywords.is_none_or(|kw| contains_any_keyword(&s.descricao, kw));
            // Inner join: rows without an operator never reach the totals.
            let Some(name) = names.get(&s.registro_ans) else {
                continue;
            };
            if in_scope && matches {
                *totals.entry(name.clone()).or_default() += s.valor;
            }
        }

        let mut rows = totals
            .into_iter()
            .map(|(display_name, total)| ExpenseRow { display_name, total })
            .collect::<Vec<_>>();
        rank(&mut rows, limit);
        Ok(rows)
    }
}
