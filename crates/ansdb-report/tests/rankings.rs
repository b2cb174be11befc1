use ansdb_core::{FinancialStatement, Operator};
use ansdb_report::{
    export_reports, AggregationEngine, ExpenseSource, ReportScope, ScopeMode, Tier, TOP_N,
};
use ansdb_sync::{BatchWriter, MemoryStore};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tempfile::tempdir;
use uuid::Uuid;

fn operator(key: &str, name: &str) -> Operator {
    let mut op = Operator::new(key);
    op.razao_social = Some(name.to_string());
    op
}

fn statement(key: &str, date: (i32, u32, u32), periodo: &str, descricao: &str, cents: i64) -> FinancialStatement {
    FinancialStatement {
        data: NaiveDate::from_ymd_opt(date.0, date.1, date.2).expect("date"),
        registro_ans: key.to_string(),
        conta: Some("411111".to_string()),
        descricao: descricao.to_string(),
        valor: Decimal::new(cents, 2),
        periodo: periodo.to_string(),
    }
}

async fn store_with(operators: &[Operator], statements: &[FinancialStatement]) -> MemoryStore {
    let store = MemoryStore::new();
    BatchWriter::<Operator>::write_batch(&store, operators)
        .await
        .expect("operators");
    BatchWriter::<FinancialStatement>::write_batch(&store, statements)
        .await
        .expect("statements");
    store
}

fn names(rows: &[ansdb_report::ExpenseRow]) -> Vec<&str> {
    rows.iter().filter_map(|r| r.display_name.as_deref()).collect()
}

#[tokio::test]
async fn period_without_keyword_rows_falls_back_to_unfiltered_ranking() {
    let store = store_with(
        &[operator("1", "ALFA"), operator("2", "BETA")],
        &[
            statement("1", (2024, 3, 31), "1T2024", "RECEITA DE CONTRAPRESTACOES", 1000),
            statement("2", (2024, 3, 31), "1T2024", "DESPESAS ADMINISTRATIVAS", 3000),
        ],
    )
    .await;

    let report = AggregationEngine::new(&store)
        .top_expenses(ReportScope::Period("1T2024".into()))
        .await
        .expect("report");
    assert_eq!(report.tier, Tier::Unfiltered);
    assert_eq!(names(&report.rows), vec!["BETA", "ALFA"]);
}

#[tokio::test]
async fn year_without_keyword_rows_falls_back_to_unfiltered_ranking() {
    let store = store_with(
        &[operator("1", "ALFA"), operator("2", "BETA"), operator("3", "GAMA")],
        &[
            statement("1", (2024, 3, 31), "1T2024", "RECEITA DE CONTRAPRESTACOES", 1000),
            statement("2", (2024, 6, 30), "2T2024", "DESPESAS ADMINISTRATIVAS", 3000),
            statement("1", (2024, 6, 30), "2T2024", "DESPESAS ADMINISTRATIVAS", 2500),
            // Keyword row in another year must not make 2024 filtered.
            statement("3", (2023, 12, 31), "4T2023", "EVENTOS INDENIZAVEIS", 9000),
        ],
    )
    .await;

    let report = AggregationEngine::new(&store)
        .top_expenses(ReportScope::Year(2024))
        .await
        .expect("report");
    assert_eq!(report.tier, Tier::Unfiltered);
    assert_eq!(names(&report.rows), vec!["ALFA", "BETA"]);
    assert_eq!(report.rows[0].total, Decimal::new(3500, 2));
}

#[tokio::test]
async fn non_empty_filtered_ranking_is_not_supplemented() {
    let store = store_with(
        &[operator("1", "ALFA"), operator("2", "BETA")],
        &[
            statement("1", (2024, 3, 31), "1T2024", "Eventos indenizáveis líquidos", 100),
            statement("2", (2024, 3, 31), "1T2024", "DESPESAS ADMINISTRATIVAS", 900_000),
        ],
    )
    .await;

    let report = AggregationEngine::new(&store)
        .top_expenses(ReportScope::Period("1T2024".into()))
        .await
        .expect("report");
    assert_eq!(report.tier, Tier::Filtered);
    assert_eq!(names(&report.rows), vec!["ALFA"]);
}

#[tokio::test]
async fn accented_keywords_match_ignoring_case() {
    let store = store_with(
        &[operator("1", "ALFA"), operator("2", "BETA")],
        &[
            statement("1", (2024, 3, 31), "1T2024", "despesas com assistência médica", 500),
            statement("2", (2024, 3, 31), "1T2024", "planos de saúde coletivos", 400),
        ],
    )
    .await;

    let rows = store
        .grouped_expenses(
            &ReportScope::Period("1T2024".into()),
            Some(&ansdb_core::REPORT_KEYWORDS),
            TOP_N,
        )
        .await
        .expect("rows");
    assert_eq!(names(&rows), vec!["ALFA", "BETA"]);
}

#[tokio::test]
async fn ranking_is_capped_at_ten_and_sums_per_operator() {
    let operators = (1..=12)
        .map(|i| operator(&i.to_string(), &format!("OPERADORA {i:02}")))
        .collect::<Vec<_>>();
    let mut statements = (1..=12)
        .map(|i| statement(&i.to_string(), (2024, 3, 31), "1T2024", "SINISTROS", i * 100))
        .collect::<Vec<_>>();
    // Second line for operator 1 lifts it to the top.
    statements.push(statement("1", (2024, 2, 28), "1T2024", "EVENTOS", 5_000));
    let store = store_with(&operators, &statements).await;

    let report = AggregationEngine::new(&store)
        .top_expenses(ReportScope::Period("1T2024".into()))
        .await
        .expect("report");
    assert_eq!(report.rows.len(), TOP_N);
    assert_eq!(report.rows[0].display_name.as_deref(), Some("OPERADORA 01"));
    assert_eq!(report.rows[0].total, Decimal::new(5_100, 2));
    assert_eq!(report.rows[1].display_name.as_deref(), Some("OPERADORA 12"));
    assert!(report.rows.windows(2).all(|w| w[0].total >= w[1].total));
}

#[tokio::test]
async fn latest_scopes_follow_the_most_recent_statement_date() {
    let store = store_with(
        &[operator("1", "ALFA"), operator("2", "BETA")],
        &[
            statement("1", (2023, 12, 31), "4T2023", "EVENTOS", 9_999_00),
            statement("2", (2024, 3, 31), "1T2024", "EVENTOS", 100),
            statement("1", (2024, 6, 30), "2T2024", "SINISTROS", 200),
        ],
    )
    .await;
    let engine = AggregationEngine::new(&store);

    assert_eq!(
        engine.latest_scope(ScopeMode::LatestPeriod).await.expect("scope"),
        Some(ReportScope::Period("2T2024".into()))
    );
    assert_eq!(
        engine.latest_scope(ScopeMode::LatestYear).await.expect("scope"),
        Some(ReportScope::Year(2024))
    );

    let yearly = engine.top_expenses(ReportScope::Year(2024)).await.expect("report");
    assert_eq!(names(&yearly.rows), vec!["ALFA", "BETA"]);
    assert_eq!(yearly.rows[0].total, Decimal::new(200, 2));
}

#[tokio::test]
async fn empty_store_yields_no_reports() {
    let store = MemoryStore::new();
    let reports = AggregationEngine::new(&store).latest_reports().await.expect("reports");
    assert!(reports.is_empty());
}

#[tokio::test]
async fn exported_files_match_their_manifest() {
    let store = store_with(
        &[operator("1", "ALFA")],
        &[statement("1", (2024, 3, 31), "1T2024", "EVENTOS", 123_456)],
    )
    .await;
    let reports = AggregationEngine::new(&store).latest_reports().await.expect("reports");
    assert_eq!(reports.len(), 2);

    let dir = tempdir().expect("tempdir");
    let run_id = Uuid::new_v4();
    let artifacts = export_reports(dir.path(), run_id, Utc::now(), &reports)
        .await
        .expect("export");

    assert_eq!(artifacts.dir, dir.path().join(run_id.to_string()));
    let markdown = std::fs::read_to_string(&artifacts.markdown).expect("markdown");
    assert!(markdown.contains("R$ 1.234,56"));
    assert!(artifacts.parquet.ends_with("snapshots/top_expenses.parquet"));

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&artifacts.manifest).expect("manifest")).expect("json");
    let files = manifest["files"].as_array().expect("files");
    assert_eq!(files.len(), 3);
    for file in files {
        let path = artifacts.dir.join(file["path"].as_str().expect("path"));
        let bytes = std::fs::read(&path).expect("artifact");
        let digest = hex::encode(Sha256::digest(&bytes));
        assert_eq!(file["sha256"].as_str(), Some(digest.as_str()));
        assert_eq!(file["bytes"].as_u64(), Some(bytes.len() as u64));
    }
}
