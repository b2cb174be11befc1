//! Report files under `reports/<run_id>/`: markdown brief, JSON, a parquet
//! snapshot and a manifest with content hashes.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Decimal128Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::{ReportScope, TopExpenses};

const TOTAL_PRECISION: u8 = 38;
const TOTAL_SCALE: i8 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportArtifacts {
    pub dir: PathBuf,
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub parquet: PathBuf,
    pub manifest: PathBuf,
}

/// `R$ 1.234,56`; negatives as `-R$ 1.234,56`.
pub fn format_brl(value: &Decimal) -> String {
    let rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let plain = format!("{:.2}", rounded.abs());
    let (int_part, frac_part) = plain.split_once('.').unwrap_or((plain.as_str(), "00"));

    let digits = int_part.as_bytes();
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (idx, digit) in digits.iter().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(char::from(*digit));
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{sign}R$ {grouped},{frac_part}")
}

fn scope_heading(scope: &ReportScope) -> String {
    match scope {
        ReportScope::Period(label) => format!("Top 10 operators by expenses, period {label}"),
        ReportScope::Year(year) => format!("Top 10 operators by expenses, year {year}"),
    }
}

pub fn render_markdown(run_id: Uuid, generated_at: DateTime<Utc>, reports: &[TopExpenses]) -> String {
    let mut out = format!(
        "# ANS Expense Brief\n\n- Run ID: `{run_id}`\n- Generated: {generated_at}\n"
    );
    if reports.is_empty() {
        out.push_str("\nNo financial statements in store.\n");
        return out;
    }

    for report in reports {
        out.push_str(&format!("\n## {}\n\n", scope_heading(&report.scope)));
        out.push_str(&format!("Source: {} query\n\n", report.tier.as_str()));
        if report.rows.is_empty() {
            out.push_str("No rows.\n");
            continue;
        }
        out.push_str("| # | Operator | Total |\n|---|---|---|\n");
        for (idx, row) in report.rows.iter().enumerate() {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                idx + 1,
                row.display_name.as_deref().unwrap_or("(unnamed)"),
                format_brl(&row.total)
            ));
        }
    }
    out
}

/// Write every report artifact for `run_id` and return their paths.
pub async fn export_reports(
    reports_root: &Path,
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    reports: &[TopExpenses],
) -> Result<ReportArtifacts> {
    let dir = reports_root.join(run_id.to_string());
    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let markdown = dir.join("top_expenses.md");
    fs::write(&markdown, render_markdown(run_id, generated_at, reports))
        .await
        .context("writing top_expenses.md")?;

    let json = dir.join("top_expenses.json");
    let body = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": run_id,
        "generated_at": generated_at,
        "reports": reports,
    }))
    .context("serializing top expenses")?;
    fs::write(&json, body).await.context("writing top_expenses.json")?;

    let parquet = snapshot_dir.join("top_expenses.parquet");
    write_top_expenses_parquet(&parquet, reports)?;

    let manifest = ReportManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("top_expenses_markdown", &dir, &markdown)?,
            manifest_entry("top_expenses_json", &dir, &json)?,
            manifest_entry("top_expenses_parquet", &dir, &parquet)?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(ReportArtifacts {
        dir,
        markdown,
        json,
        parquet,
        manifest: manifest_path,
    })
}

fn write_top_expenses_parquet(path: &Path, reports: &[TopExpenses]) -> Result<()> {
    let rows = reports
        .iter()
        .flat_map(|report| {
            report
                .rows
                .iter()
                .enumerate()
                .map(move |(idx, row)| (report, idx as u32 + 1, row))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("scope", DataType::Utf8, false),
        ArrowField::new("tier", DataType::Utf8, false),
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("razao_social", DataType::Utf8, true),
        ArrowField::new("total", DataType::Decimal128(TOTAL_PRECISION, TOTAL_SCALE), false),
    ]));

    let scopes = StringArray::from(
        rows.iter()
            .map(|(report, _, _)| Some(report.scope.to_string()))
            .collect::<Vec<_>>(),
    );
    let tiers = StringArray::from(
        rows.iter()
            .map(|(report, _, _)| Some(report.tier.as_str()))
            .collect::<Vec<_>>(),
    );
    let ranks = UInt32Array::from(rows.iter().map(|(_, rank, _)| *rank).collect::<Vec<_>>());
    let names = StringArray::from(
        rows.iter()
            .map(|(_, _, row)| row.display_name.as_deref())
            .collect::<Vec<_>>(),
    );
    let totals = Decimal128Array::from(
        rows.iter()
            .map(|(_, _, row)| {
                let mut total = row
                    .total
                    .round_dp_with_strategy(TOTAL_SCALE as u32, RoundingStrategy::MidpointAwayFromZero);
                total.rescale(TOTAL_SCALE as u32);
                total.mantissa()
            })
            .collect::<Vec<_>>(),
    )
    .with_precision_and_scale(TOTAL_PRECISION, TOTAL_SCALE)
    .context("setting decimal precision")?;

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(scopes),
            Arc::new(tiers),
            Arc::new(ranks),
            Arc::new(names),
            Arc::new(totals),
        ],
    )
    .context("building top_expenses record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExpenseRow, Tier};

    #[test]
    fn currency_uses_brazilian_separators() {
        assert_eq!(format_brl(&Decimal::new(123456, 2)), "R$ 1.234,56");
        assert_eq!(format_brl(&Decimal::new(100000000, 2)), "R$ 1.000.000,00");
        assert_eq!(format_brl(&Decimal::new(5, 1)), "R$ 0,50");
        assert_eq!(format_brl(&Decimal::new(-98765, 2)), "-R$ 987,65");
        assert_eq!(format_brl(&Decimal::new(2345, 3)), "R$ 2,35");
    }

    #[test]
    fn markdown_lists_rows_in_rank_order() {
        let report = TopExpenses {
            scope: ReportScope::Period("1T2024".into()),
            tier: Tier::Unfiltered,
            rows: vec![
                ExpenseRow {
                    display_name: Some("PLANO A".into()),
                    total: Decimal::new(200000, 2),
                },
                ExpenseRow {
                    display_name: None,
                    total: Decimal::new(100, 2),
                },
            ],
        };
        let md = render_markdown(Uuid::nil(), Utc::now(), &[report]);
        assert!(md.contains("## Top 10 operators by expenses, period 1T2024"));
        assert!(md.contains("Source: unfiltered query"));
        assert!(md.contains("| 1 | PLANO A | R$ 2.000,00 |"));
        assert!(md.contains("| 2 | (unnamed) | R$ 1,00 |"));
    }
}
