//! Postgres store backed by sqlx.

use std::collections::HashMap;

use ansdb_core::{FinancialStatement, KnownOperators, Operator, OPERATOR_TEXT_COLUMNS};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::store::{BatchWriter, IngestStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // Single writer; one spare connection for reads between batches.
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Keep only the last occurrence of each key, preserving order.
///
/// Postgres rejects an `ON CONFLICT DO UPDATE` that touches one row twice.
pub(crate) fn last_write_wins(batch: &[Operator]) -> Vec<&Operator> {
    let mut last_index = HashMap::with_capacity(batch.len());
    for (idx, op) in batch.iter().enumerate() {
        last_index.insert(op.registro_ans.as_str(), idx);
    }
    batch
        .iter()
        .enumerate()
        .filter(|(idx, op)| last_index.get(op.registro_ans.as_str()) == Some(idx))
        .map(|(_, op)| op)
        .collect()
}

fn operator_upsert_prefix() -> String {
    let text_columns = OPERATOR_TEXT_COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO operadoras (registro_ans, {text_columns}, data_registro_ans) ")
}

fn operator_upsert_suffix() -> String {
    let assignments = OPERATOR_TEXT_COLUMNS
        .iter()
        .map(|c| c.name)
        .chain(std::iter::once("data_registro_ans"))
        .map(|name| format!("{name} = EXCLUDED.{name}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ON CONFLICT (registro_ans) DO UPDATE SET {assignments}")
}

#[async_trait]
impl BatchWriter<Operator> for PgStore {
    async fn write_batch(&self, batch: &[Operator]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let rows = last_write_wins(batch);

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(operator_upsert_prefix());
        qb.push_values(rows, |mut b, op| {
            b.push_bind(op.registro_ans.clone());
            for (_, value) in op.text_values() {
                b.push_bind(value.map(str::to_owned));
            }
            b.push_bind(op.data_registro_ans);
        });
        qb.push(operator_upsert_suffix());

        let mut tx = self.pool.begin().await?;
        qb.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(batch.len() as u64)
    }
}

#[async_trait]
impl BatchWriter<FinancialStatement> for PgStore {
    async fn write_batch(&self, batch: &[FinancialStatement]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO demonstracoes_contabeis (data, registro_ans, conta, descricao, valor, periodo) ",
        );
        qb.push_values(batch, |mut b, row| {
            b.push_bind(row.data)
                .push_bind(row.registro_ans.clone())
                .push_bind(row.conta.clone())
                .push_bind(row.descricao.clone())
                .push_bind(row.valor)
                .push_bind(row.periodo.clone());
        });

        let mut tx = self.pool.begin().await?;
        let result = qb.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn known_operators(&self) -> Result<KnownOperators, StoreError> {
        let keys = sqlx::query_scalar::<_, String>("SELECT registro_ans FROM operadoras")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys.into_iter().collect())
    }

    async fn statement_count_for_period(&self, periodo: &str) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM demonstracoes_contabeis WHERE periodo = $1",
        )
        .bind(periodo)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
