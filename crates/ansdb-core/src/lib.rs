//! Core domain model, column budgets and run outcome types for ANSDB.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ansdb-core";

/// Description substrings that admit a statement row into the pipeline.
pub const ACCEPTANCE_KEYWORDS: [&str; 2] = ["EVENTOS", "SINISTROS"];

/// Description substrings used by the tier-1 expense report.
pub const REPORT_KEYWORDS: [&str; 4] = ["EVENTOS", "SINISTROS", "ASSISTÊNCIA", "SAÚDE"];

/// Case-insensitive substring match against any keyword.
pub fn contains_any_keyword(text: &str, keywords: &[&str]) -> bool {
    let haystack = text.to_uppercase();
    keywords
        .iter()
        .any(|needle| haystack.contains(&needle.to_uppercase()))
}

/// Canonical column name plus its VARCHAR budget in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub max_chars: usize,
}

const fn col(name: &'static str, max_chars: usize) -> ColumnSpec {
    ColumnSpec { name, max_chars }
}

pub const OPERATOR_KEY: ColumnSpec = col("registro_ans", 20);

/// Non-key text columns of `operadoras`, in table order.
pub const OPERATOR_TEXT_COLUMNS: [ColumnSpec; 17] = [
    col("cnpj", 20),
    col("razao_social", 255),
    col("nome_fantasia", 255),
    col("modalidade", 100),
    col("logradouro", 255),
    col("numero", 50),
    col("complemento", 255),
    col("bairro", 100),
    col("cidade", 100),
    col("uf", 2),
    col("cep", 10),
    col("ddd", 5),
    col("telefone", 50),
    col("fax", 50),
    col("email", 100),
    col("representante", 255),
    col("cargo_representante", 100),
];

pub const STATEMENT_CONTA: ColumnSpec = col("conta", 100);
pub const STATEMENT_DESCRICAO: ColumnSpec = col("descricao", 255);
pub const STATEMENT_PERIODO: ColumnSpec = col("periodo", 20);

pub fn operator_column(name: &str) -> Option<ColumnSpec> {
    if name == OPERATOR_KEY.name {
        return Some(OPERATOR_KEY);
    }
    OPERATOR_TEXT_COLUMNS.iter().copied().find(|c| c.name == name)
}

/// A registered health-plan operator (`operadoras`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Operator {
    pub registro_ans: String,
    pub cnpj: Option<String>,
    pub razao_social: Option<String>,
    pub nome_fantasia: Option<String>,
    pub modalidade: Option<String>,
    pub logradouro: Option<String>,
    pub numero: Option<String>,
    pub complemento: Option<String>,
    pub bairro: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
    pub cep: Option<String>,
    pub ddd: Option<String>,
    pub telefone: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
    pub representante: Option<String>,
    pub cargo_representante: Option<String>,
    pub data_registro_ans: Option<NaiveDate>,
}

impl Operator {
    pub fn new(registro_ans: impl Into<String>) -> Self {
        Self {
            registro_ans: registro_ans.into(),
            ..Default::default()
        }
    }

    /// Non-key text values paired with their column spec, in `OPERATOR_TEXT_COLUMNS` order.
    pub fn text_values(&self) -> [(ColumnSpec, Option<&str>); 17] {
        let values = [
            &self.cnpj,
            &self.razao_social,
            &self.nome_fantasia,
            &self.modalidade,
            &self.logradouro,
            &self.numero,
            &self.complemento,
            &self.bairro,
            &self.cidade,
            &self.uf,
            &self.cep,
            &self.ddd,
            &self.telefone,
            &self.fax,
            &self.email,
            &self.representante,
            &self.cargo_representante,
        ];
        let mut out = [(OPERATOR_KEY, None); 17];
        for (i, value) in values.into_iter().enumerate() {
            out[i] = (OPERATOR_TEXT_COLUMNS[i], value.as_deref());
        }
        out
    }

    /// Mutable slot for a canonical text column, used by the normalizer's mapping table.
    pub fn text_slot_mut(&mut self, column: &str) -> Option<&mut Option<String>> {
        let slot = match column {
            "cnpj" => &mut self.cnpj,
            "razao_social" => &mut self.razao_social,
            "nome_fantasia" => &mut self.nome_fantasia,
            "modalidade" => &mut self.modalidade,
            "logradouro" => &mut self.logradouro,
            "numero" => &mut self.numero,
            "complemento" => &mut self.complemento,
            "bairro" => &mut self.bairro,
            "cidade" => &mut self.cidade,
            "uf" => &mut self.uf,
            "cep" => &mut self.cep,
            "ddd" => &mut self.ddd,
            "telefone" => &mut self.telefone,
            "fax" => &mut self.fax,
            "email" => &mut self.email,
            "representante" => &mut self.representante,
            "cargo_representante" => &mut self.cargo_representante,
            _ => return None,
        };
        Some(slot)
    }
}

/// One disclosed account line (`demonstracoes_contabeis`) before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialStatement {
    pub data: NaiveDate,
    pub registro_ans: String,
    pub conta: Option<String>,
    pub descricao: String,
    pub valor: Decimal,
    pub periodo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub const ALL: [Quarter; 4] = [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4];

    pub fn of_month(month: u32) -> Self {
        match month {
            1..=3 => Quarter::Q1,
            4..=6 => Quarter::Q2,
            7..=9 => Quarter::Q3,
            _ => Quarter::Q4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Quarter::Q1 => "1T",
            Quarter::Q2 => "2T",
            Quarter::Q3 => "3T",
            Quarter::Q4 => "4T",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid period label {0:?}, expected e.g. 1T2024")]
pub struct PeriodParseError(pub String);

/// Quarter-year reporting period, labelled `1T2024`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub quarter: Quarter,
}

impl Period {
    pub fn new(quarter: Quarter, year: i32) -> Self {
        Self { year, quarter }
    }

    pub fn label(&self) -> String {
        format!("{}{}", self.quarter.label(), self.year)
    }

    pub fn archive_file_name(&self) -> String {
        format!("{}.zip", self.label())
    }

    pub fn csv_file_name(&self) -> String {
        format!("{}.csv", self.label())
    }

    /// `{base_url}/{year}/{quarter}{year}.zip`
    pub fn archive_url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.year,
            self.archive_file_name()
        )
    }

    /// Every quarter of the trailing `years` calendar years up to `today`,
    /// oldest first, excluding quarters that have not started yet.
    pub fn trailing(today: NaiveDate, years: u32) -> Vec<Period> {
        let current_year = today.year();
        let current_quarter = Quarter::of_month(today.month());
        let first_year = current_year - years.max(1) as i32 + 1;
        (first_year..=current_year)
            .flat_map(|year| Quarter::ALL.into_iter().map(move |q| Period::new(q, year)))
            .filter(|p| p.year < current_year || p.quarter <= current_quarter)
            .collect()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.quarter.label(), self.year)
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PeriodParseError(s.to_string());
        let trimmed = s.trim();
        let (q, year) = trimmed.split_at_checked(2).ok_or_else(err)?;
        let quarter = Quarter::ALL
            .into_iter()
            .find(|candidate| candidate.label().eq_ignore_ascii_case(q))
            .ok_or_else(err)?;
        if year.len() != 4 {
            return Err(err());
        }
        let year = year.parse::<i32>().map_err(|_| err())?;
        Ok(Period::new(quarter, year))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Operator,
    FinancialStatement,
}

impl EntityKind {
    pub fn batch_size(self) -> usize {
        match self {
            EntityKind::Operator => 500,
            EntityKind::FinancialStatement => 1000,
        }
    }
}

/// Operator keys present in the store, snapshotted once per statement run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownOperators {
    keys: HashSet<String>,
}

impl KnownOperators {
    pub fn contains(&self, registro_ans: &str) -> bool {
        self.keys.contains(registro_ans)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for KnownOperators {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SkipKind {
    Connectivity,
    Parse,
    ConstraintViolation,
    Filtered,
}

/// Why a row, file or period was left out of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Connectivity(String),
    Parse(String),
    ConstraintViolation(String),
    /// Row is well-formed but outside the accepted subset (keyword filter).
    Filtered(String),
}

impl SkipReason {
    pub fn kind(&self) -> SkipKind {
        match self {
            SkipReason::Connectivity(_) => SkipKind::Connectivity,
            SkipReason::Parse(_) => SkipKind::Parse,
            SkipReason::ConstraintViolation(_) => SkipKind::ConstraintViolation,
            SkipReason::Filtered(_) => SkipKind::Filtered,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Connectivity(msg) => write!(f, "connectivity: {msg}"),
            SkipReason::Parse(msg) => write!(f, "parse: {msg}"),
            SkipReason::ConstraintViolation(msg) => write!(f, "constraint violation: {msg}"),
            SkipReason::Filtered(msg) => write!(f, "filtered: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSkip {
    /// 1-based line in the source file (header is line 1).
    pub line: u64,
    pub registro_ans: Option<String>,
    pub reason: SkipReason,
}

/// Per-row result of normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome<T> {
    Accepted(T),
    Skipped(RowSkip),
}

impl<T> RowOutcome<T> {
    pub fn accepted(self) -> Option<T> {
        match self {
            RowOutcome::Accepted(record) => Some(record),
            RowOutcome::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// 1-based batch number within the run.
    pub index: usize,
    pub first_record: usize,
    pub records: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub entity: EntityKind,
    pub source: String,
    pub imported: u64,
    pub skipped: usize,
    pub skipped_by_kind: BTreeMap<SkipKind, usize>,
    pub failed_batches: Vec<BatchFailure>,
}

impl RunSummary {
    pub fn new(entity: EntityKind, source: impl Into<String>) -> Self {
        Self {
            entity,
            source: source.into(),
            imported: 0,
            skipped: 0,
            skipped_by_kind: BTreeMap::new(),
            failed_batches: Vec::new(),
        }
    }

    pub fn record_skip(&mut self, reason: &SkipReason) {
        self.skipped += 1;
        *self.skipped_by_kind.entry(reason.kind()).or_default() += 1;
    }

    pub fn failed_records(&self) -> usize {
        self.failed_batches.iter().map(|b| b.records).sum()
    }
}

/// Result of one unit of work: the operator registry file or one statement period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOutcome {
    Imported(RunSummary),
    Skipped { unit: String, reason: SkipReason },
}

impl UnitOutcome {
    pub fn imported(&self) -> u64 {
        match self {
            UnitOutcome::Imported(summary) => summary.imported,
            UnitOutcome::Skipped { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn period_labels_parse_back() {
        let period: Period = "3T2023".parse().expect("parse");
        assert_eq!(period, Period::new(Quarter::Q3, 2023));
        assert_eq!(period.label(), "3T2023");
        assert_eq!(period.to_string(), "3T2023");
        assert!("5T2023".parse::<Period>().is_err());
        assert!("1T23".parse::<Period>().is_err());
        assert!("".parse::<Period>().is_err());
    }

    #[test]
    fn archive_url_follows_year_directory_layout() {
        let period = Period::new(Quarter::Q1, 2024);
        assert_eq!(
            period.archive_url("https://dadosabertos.ans.gov.br/FTP/PDA/demonstracoes_contabeis/"),
            "https://dadosabertos.ans.gov.br/FTP/PDA/demonstracoes_contabeis/2024/1T2024.zip"
        );
        assert_eq!(period.csv_file_name(), "1T2024.csv");
    }

    #[test]
    fn trailing_periods_skip_future_quarters() {
        let periods = Period::trailing(date(2024, 5, 10), 2);
        let labels = periods.iter().map(Period::label).collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec!["1T2023", "2T2023", "3T2023", "4T2023", "1T2024", "2T2024"]
        );
    }

    #[test]
    fn keyword_match_ignores_case_and_accents_are_preserved() {
        assert!(contains_any_keyword(
            "eventos/ sinistros conhecidos ou avisados",
            &ACCEPTANCE_KEYWORDS
        ));
        assert!(contains_any_keyword("Assistência médica", &REPORT_KEYWORDS));
        assert!(!contains_any_keyword("RECEITA DE APLICACOES", &REPORT_KEYWORDS));
    }

    #[test]
    fn run_summary_tallies_skip_kinds() {
        let mut summary = RunSummary::new(EntityKind::Operator, "operadoras_ativas.csv");
        summary.record_skip(&SkipReason::Parse("bad date".into()));
        summary.record_skip(&SkipReason::ConstraintViolation("null key".into()));
        summary.record_skip(&SkipReason::ConstraintViolation("null key".into()));
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.skipped_by_kind[&SkipKind::ConstraintViolation], 2);
    }

    #[test]
    fn every_skip_reason_maps_to_its_kind() {
        let cases = [
            (SkipReason::Connectivity("timeout".into()), SkipKind::Connectivity, "connectivity: timeout"),
            (SkipReason::Parse("bad date".into()), SkipKind::Parse, "parse: bad date"),
            (
                SkipReason::ConstraintViolation("null key".into()),
                SkipKind::ConstraintViolation,
                "constraint violation: null key",
            ),
            (SkipReason::Filtered("no keyword".into()), SkipKind::Filtered, "filtered: no keyword"),
        ];
        for (reason, kind, text) in cases {
            assert_eq!(reason.kind(), kind);
            assert_eq!(reason.to_string(), text);
        }
    }
}
