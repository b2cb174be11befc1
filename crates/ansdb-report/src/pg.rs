use ansdb_sync::PgStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::{ExpenseRow, ExpenseSource, LatestStatement, ReportError, ReportScope};

/// Upper-cased on both sides; the ICU collation folds accented letters whatever
/// the database locale is.
const DESCRICAO_UPPER: &str = r#"UPPER(d.descricao COLLATE "und-x-icu") LIKE "#;

pub(crate) fn keyword_pattern(keyword: &str) -> String {
    format!("%{}%", keyword.to_uppercase())
}

/// `SELECT … GROUP BY razao_social` for one scope, optionally keyword-filtered.
pub(crate) fn grouped_expenses_query<'a>(
    scope: &'a ReportScope,
    keywords: Option<&[&str]>,
    limit: usize,
) -> QueryBuilder<'a, Postgres> {
    let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new(
        r#"
        SELECT o.razao_social, SUM(d.valor) AS total
          FROM demonstracoes_contabeis d
          JOIN operadoras o ON o.registro_ans = d.registro_ans
         WHERE "#,
    );
    match scope {
        ReportScope::Period(label) => {
            qb.push("d.periodo = ").push_bind(label.as_str());
        }
        ReportScope::Year(year) => {
            qb.push("EXTRACT(YEAR FROM d.data)::int = ").push_bind(*year);
        }
    }

    if let Some(keywords) = keywords.filter(|kw| !kw.is_empty()) {
        qb.push(" AND (");
        let mut separated = qb.separated(" OR ");
        for keyword in keywords {
            separated
                .push(DESCRICAO_UPPER)
                .push_bind_unseparated(keyword_pattern(keyword));
        }
        qb.push(")");
    }

    qb.push(" GROUP BY o.razao_social ORDER BY total DESC, o.razao_social ASC NULLS LAST LIMIT ")
        .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    qb
}

#[async_trait]
impl ExpenseSource for PgStore {
    async fn latest_statement(&self) -> Result<Option<LatestStatement>, ReportError> {
        let row = sqlx::query(
            r#"
            SELECT periodo, data
              FROM demonstracoes_contabeis
             ORDER BY data DESC, id DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(LatestStatement {
                periodo: row.try_get("periodo")?,
                data: row.try_get::<NaiveDate, _>("data")?,
            })),
            None => Ok(None),
        }
    }

    async fn grouped_expenses(
        &self,
        scope: &ReportScope,
        keywords: Option<&[&str]>,
        limit: usize,
    ) -> Result<Vec<ExpenseRow>, ReportError> {
        let mut qb = grouped_expenses_query(scope, keywords, limit);
        let rows = qb.build().fetch_all(self.pool()).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExpenseRow {
                display_name: row.try_get("razao_social")?,
                total: row.try_get::<Decimal, _>("total")?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ansdb_core::REPORT_KEYWORDS;

    #[test]
    fn filtered_year_query_binds_every_keyword() {
        let scope = ReportScope::Year(2024);
        let qb = grouped_expenses_query(&scope, Some(&REPORT_KEYWORDS), 10);
        let sql = qb.sql();
        assert!(sql.contains("EXTRACT(YEAR FROM d.data)::int = $1"));
        assert_eq!(sql.matches(r#"UPPER(d.descricao COLLATE "und-x-icu") LIKE $"#).count(), 4);
        assert!(sql.contains(r#"LIKE $2 OR UPPER(d.descricao COLLATE "und-x-icu") LIKE $3"#));
        assert!(!sql.contains("ILIKE"));
        assert!(sql.trim_end().ends_with("LIMIT $6"));
    }

    #[test]
    fn unfiltered_period_query_has_no_keyword_clause() {
        let scope = ReportScope::Period("1T2024".into());
        let qb = grouped_expenses_query(&scope, None, 10);
        let sql = qb.sql();
        assert!(sql.contains("d.periodo = $1"));
        assert!(!sql.contains("LIKE"));
        assert!(sql.contains("ORDER BY total DESC, o.razao_social ASC"));
    }

    #[test]
    fn keyword_patterns_are_upper_cased_with_accents() {
        assert_eq!(keyword_pattern("saúde"), "%SAÚDE%");
        assert_eq!(keyword_pattern("Assistência"), "%ASSISTÊNCIA%");
        let upper: Vec<String> = REPORT_KEYWORDS.iter().map(|kw| keyword_pattern(kw)).collect();
        assert!(upper.iter().all(|p| *p == p.to_uppercase()));
    }
}
