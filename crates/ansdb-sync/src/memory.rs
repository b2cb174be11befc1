//! In-process store with the same key, foreign-key and length constraints as the schema.

use std::collections::BTreeMap;

use ansdb_core::{
    FinancialStatement, KnownOperators, Operator, OPERATOR_KEY, STATEMENT_CONTA,
    STATEMENT_DESCRICAO, STATEMENT_PERIODO,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::store::{BatchWriter, IngestStore, StoreError};

/// NUMERIC(15, 2) holds at most 13 integer digits.
const VALOR_LIMIT: i64 = 10_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredStatement {
    pub id: i64,
    pub statement: FinancialStatement,
}

#[derive(Debug, Default)]
struct MemoryState {
    operators: BTreeMap<String, Operator>,
    statements: Vec<StoredStatement>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn operators(&self) -> Vec<Operator> {
        self.state.lock().await.operators.values().cloned().collect()
    }

    pub async fn operator(&self, registro_ans: &str) -> Option<Operator> {
        self.state.lock().await.operators.get(registro_ans).cloned()
    }

    pub async fn statements(&self) -> Vec<StoredStatement> {
        self.state.lock().await.statements.clone()
    }
}

fn check_len(table: &str, column: &str, value: Option<&str>, max_chars: usize) -> Result<(), StoreError> {
    match value {
        Some(v) if v.chars().count() > max_chars => Err(StoreError::Constraint(format!(
            "value too long for {table}.{column} (max {max_chars})"
        ))),
        _ => Ok(()),
    }
}

fn check_operator(op: &Operator) -> Result<(), StoreError> {
    if op.registro_ans.is_empty() {
        return Err(StoreError::Constraint("operadoras.registro_ans is null".into()));
    }
    check_len("operadoras", OPERATOR_KEY.name, Some(&op.registro_ans), OPERATOR_KEY.max_chars)?;
    for (spec, value) in op.text_values() {
        check_len("operadoras", spec.name, value, spec.max_chars)?;
    }
    Ok(())
}

fn check_statement(
    row: &FinancialStatement,
    operators: &BTreeMap<String, Operator>,
) -> Result<(), StoreError> {
    const TABLE: &str = "demonstracoes_contabeis";
    if !operators.contains_key(&row.registro_ans) {
        return Err(StoreError::Constraint(format!(
            "{TABLE}.registro_ans {} references no operator",
            row.registro_ans
        )));
    }
    check_len(TABLE, OPERATOR_KEY.name, Some(&row.registro_ans), OPERATOR_KEY.max_chars)?;
    check_len(TABLE, STATEMENT_CONTA.name, row.conta.as_deref(), STATEMENT_CONTA.max_chars)?;
    check_len(TABLE, STATEMENT_DESCRICAO.name, Some(&row.descricao), STATEMENT_DESCRICAO.max_chars)?;
    check_len(TABLE, STATEMENT_PERIODO.name, Some(&row.periodo), STATEMENT_PERIODO.max_chars)?;
    if row.valor.abs() >= Decimal::from(VALOR_LIMIT) {
        return Err(StoreError::Constraint(format!("{TABLE}.valor overflows NUMERIC(15, 2)")));
    }
    Ok(())
}

#[async_trait]
impl BatchWriter<Operator> for MemoryStore {
    async fn write_batch(&self, batch: &[Operator]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        batch.iter().try_for_each(check_operator)?;
        for op in batch {
            state.operators.insert(op.registro_ans.clone(), op.clone());
        }
        Ok(batch.len() as u64)
    }
}

#[async_trait]
impl BatchWriter<FinancialStatement> for MemoryStore {
    async fn write_batch(&self, batch: &[FinancialStatement]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        for row in batch {
            check_statement(row, &state.operators)?;
        }
        for row in batch {
            state.next_id += 1;
            let id = state.next_id;
            state.statements.push(StoredStatement {
                id,
                statement: row.clone(),
            });
        }
        Ok(batch.len() as u64)
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn known_operators(&self) -> Result<KnownOperators, StoreError> {
        let state = self.state.lock().await;
        Ok(state.operators.keys().cloned().collect())
    }

    async fn statement_count_for_period(&self, periodo: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .statements
            .iter()
            .filter(|s| s.statement.periodo == periodo)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn statement(registro_ans: &str) -> FinancialStatement {
        FinancialStatement {
            data: NaiveDate::from_ymd_opt(2024, 3, 31).expect("date"),
            registro_ans: registro_ans.into(),
            conta: Some("411111".into()),
            descricao: "EVENTOS/ SINISTROS CONHECIDOS OU AVISADOS".into(),
            valor: Decimal::new(123456, 2),
            periodo: "1T2024".into(),
        }
    }

    async fn put_operators(store: &MemoryStore, rows: &[Operator]) -> Result<u64, StoreError> {
        BatchWriter::<Operator>::write_batch(store, rows).await
    }

    async fn put_statements(
        store: &MemoryStore,
        rows: &[FinancialStatement],
    ) -> Result<u64, StoreError> {
        BatchWriter::<FinancialStatement>::write_batch(store, rows).await
    }

    #[tokio::test]
    async fn statement_batch_with_dangling_key_writes_nothing() {
        let store = MemoryStore::new();
        put_operators(&store, &[Operator::new("417726")]).await.expect("operator");

        let err = put_statements(&store, &[statement("417726"), statement("999999")])
            .await
            .expect_err("fk violation");
        assert!(matches!(err, StoreError::Constraint(_)));
        assert!(store.statements().await.is_empty());
    }

    #[tokio::test]
    async fn overlong_operator_value_rejects_batch() {
        let store = MemoryStore::new();
        let mut bad = Operator::new("300000");
        bad.uf = Some("SPX".into());
        let err = put_operators(&store, &[Operator::new("417726"), bad])
            .await
            .expect_err("too long");
        assert!(err.to_string().contains("operadoras.uf"));
        assert!(store.operators().await.is_empty());
    }

    #[tokio::test]
    async fn statement_ids_are_sequential() {
        let store = MemoryStore::new();
        put_operators(&store, &[Operator::new("417726")]).await.expect("operator");
        put_statements(&store, &[statement("417726"), statement("417726")])
            .await
            .expect("statements");
        let ids = store.statements().await.iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.statement_count_for_period("1T2024").await.expect("count"), 2);
    }
}
