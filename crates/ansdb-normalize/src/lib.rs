//! Raw delimited text -> canonical typed records.
//!
//! A [`RawTable`] owns the decoded file text. Each call to
//! [`RawTable::normalize`] starts a fresh reader over that text, so the
//! returned row iterator is lazy and can be recomputed at will.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use ansdb_core::{
    contains_any_keyword, operator_column, FinancialStatement, KnownOperators, Operator,
    RowOutcome, RowSkip, SkipReason, ACCEPTANCE_KEYWORDS, OPERATOR_KEY, STATEMENT_CONTA,
    STATEMENT_DESCRICAO,
};
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

pub const CRATE_NAME: &str = "ansdb-normalize";

pub const DELIMITER: u8 = b';';
pub const OPERATOR_DATE_FORMAT: &str = "%d/%m/%Y";
pub const STATEMENT_DATE_FORMAT: &str = "%Y-%m-%d";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Source column (after header normalization) -> canonical operator field.
pub const OPERATOR_COLUMN_MAP: [(&str, &str); 19] = [
    ("registro_ans", "registro_ans"),
    ("cnpj", "cnpj"),
    ("razao_social", "razao_social"),
    ("nome_fantasia", "nome_fantasia"),
    ("modalidade", "modalidade"),
    ("logradouro", "logradouro"),
    ("numero", "numero"),
    ("complemento", "complemento"),
    ("bairro", "bairro"),
    ("cidade", "cidade"),
    ("uf", "uf"),
    ("cep", "cep"),
    ("ddd", "ddd"),
    ("telefone", "telefone"),
    ("fax", "fax"),
    ("endereco_eletronico", "email"),
    ("representante", "representante"),
    ("cargo_representante", "cargo_representante"),
    ("data_registro_ans", "data_registro_ans"),
];

/// Statement source columns (upper-cased): data, registro_ans, conta, descricao, valor.
const STATEMENT_REQUIRED: [&str; 5] = ["DATA", "REG_ANS", "CD_CONTA_CONTABIL", "DESCRICAO", "VL_SALDO_FINAL"];
const OPERATOR_REQUIRED: [&str; 1] = ["registro_ans"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{file} is missing required columns: {}", missing.join(", "))]
    MissingColumns { file: String, missing: Vec<String> },
    #[error("{file}: unreadable header row: {message}")]
    Header { file: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Latin1,
    Utf8,
}

/// UTF-8 when the bytes start with a BOM (which is dropped), ISO-8859-1 otherwise.
pub fn decode_text(bytes: &[u8]) -> (String, TextEncoding) {
    match bytes.strip_prefix(UTF8_BOM) {
        Some(rest) => (String::from_utf8_lossy(rest).into_owned(), TextEncoding::Utf8),
        None => (bytes.iter().map(|&b| char::from(b)).collect(), TextEncoding::Latin1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCase {
    /// Trim, spaces to `_`, lower-case.
    Lower,
    /// Trim, upper-case.
    Upper,
}

pub fn normalize_header(raw: &str, case: HeaderCase) -> String {
    let trimmed = raw.trim();
    match case {
        HeaderCase::Lower => trimmed.replace(' ', "_").to_lowercase(),
        HeaderCase::Upper => trimmed.to_uppercase(),
    }
}

pub fn is_null_token(value: &str) -> bool {
    value.is_empty()
        || ["nan", "null", "none"]
            .iter()
            .any(|token| value.eq_ignore_ascii_case(token))
}

/// Trim, map null-like tokens to `None`, clip to `max_chars` characters.
pub fn clip_text(raw: &str, max_chars: usize) -> Option<String> {
    let trimmed = raw.trim();
    if is_null_token(trimmed) {
        return None;
    }
    Some(trimmed.chars().take(max_chars).collect())
}

pub fn parse_date(raw: &str, format: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if is_null_token(trimmed) {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, format).ok()
}

/// `1.234,56` -> `1234.56`: drop `.` thousands separators, `,` becomes the decimal point.
/// Extra fraction digits round half away from zero, as a `NUMERIC(15,2)` column would.
pub fn parse_brl_amount(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if is_null_token(trimmed) {
        return None;
    }
    let normalized = trimmed.replace('.', "").replace(',', ".");
    Decimal::from_str(&normalized)
        .ok()
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// Decoded contents of one delimited source file.
#[derive(Debug, Clone)]
pub struct RawTable {
    file: String,
    text: String,
    encoding: TextEncoding,
}

impl RawTable {
    pub fn from_bytes(file: impl Into<String>, bytes: &[u8]) -> Self {
        let (text, encoding) = decode_text(bytes);
        Self {
            file: file.into(),
            text,
            encoding,
        }
    }

    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::from_bytes(file, &bytes))
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Start a fresh pass over the rows. Fails when required columns are absent.
    pub fn normalize<M: RecordMapper>(&self, mapper: M) -> Result<Rows<'_, M>, NormalizeError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(DELIMITER)
            .flexible(true)
            .from_reader(self.text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| NormalizeError::Header {
                file: self.file.clone(),
                message: e.to_string(),
            })?
            .clone();
        let columns = ColumnIndex::new(&headers, M::HEADER_CASE);

        let missing = mapper
            .required_columns()
            .iter()
            .filter(|c| !columns.contains(c))
            .map(|c| c.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(NormalizeError::MissingColumns {
                file: self.file.clone(),
                missing,
            });
        }

        Ok(Rows {
            records: reader.into_records(),
            columns,
            mapper,
        })
    }

    pub fn operators(&self) -> Result<Rows<'_, OperatorMapper>, NormalizeError> {
        self.normalize(OperatorMapper)
    }

    pub fn statements<'a>(
        &'a self,
        periodo: &str,
        known: &'a KnownOperators,
    ) -> Result<Rows<'a, StatementMapper<'a>>, NormalizeError> {
        self.normalize(StatementMapper::new(periodo, known))
    }
}

#[derive(Debug, Clone)]
pub struct ColumnIndex {
    by_name: HashMap<String, usize>,
}

impl ColumnIndex {
    fn new(headers: &csv::StringRecord, case: HeaderCase) -> Self {
        let mut by_name = HashMap::with_capacity(headers.len());
        for (idx, raw) in headers.iter().enumerate() {
            by_name.entry(normalize_header(raw, case)).or_insert(idx);
        }
        Self { by_name }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

/// One data row with header-name lookup.
pub struct SourceRow<'r> {
    record: &'r csv::StringRecord,
    columns: &'r ColumnIndex,
    pub line: u64,
}

impl<'r> SourceRow<'r> {
    /// Cell text as read; `None` when the column or the cell is absent.
    pub fn raw(&self, column: &str) -> Option<&'r str> {
        self.columns.get(column).and_then(|idx| self.record.get(idx))
    }

    pub fn text(&self, column: &str, max_chars: usize) -> Option<String> {
        self.raw(column).and_then(|v| clip_text(v, max_chars))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    pub registro_ans: Option<String>,
    pub reason: SkipReason,
}

impl RowRejection {
    fn new(registro_ans: Option<String>, reason: SkipReason) -> Self {
        Self {
            registro_ans,
            reason,
        }
    }
}

/// Entity-specific mapping from a source row to a canonical record.
pub trait RecordMapper {
    type Record;
    const HEADER_CASE: HeaderCase;

    fn required_columns(&self) -> &[&'static str];
    fn map_row(&self, row: &SourceRow<'_>) -> Result<Self::Record, RowRejection>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OperatorMapper;

impl RecordMapper for OperatorMapper {
    type Record = Operator;
    const HEADER_CASE: HeaderCase = HeaderCase::Lower;

    fn required_columns(&self) -> &[&'static str] {
        &OPERATOR_REQUIRED
    }

    fn map_row(&self, row: &SourceRow<'_>) -> Result<Operator, RowRejection> {
        let registro_ans = row.text("registro_ans", OPERATOR_KEY.max_chars).ok_or_else(|| {
            RowRejection::new(
                None,
                SkipReason::ConstraintViolation("registro_ans is null".into()),
            )
        })?;

        let mut operator = Operator::new(registro_ans);
        for (source, canonical) in OPERATOR_COLUMN_MAP {
            let Some(spec) = operator_column(canonical) else {
                continue;
            };
            if let Some(slot) = operator.text_slot_mut(canonical) {
                *slot = row.text(source, spec.max_chars);
            }
        }
        operator.data_registro_ans = row
            .raw("data_registro_ans")
            .and_then(|v| parse_date(v, OPERATOR_DATE_FORMAT));
        Ok(operator)
    }
}

/// Maps statement rows and applies the acceptance filter against known operators.
#[derive(Debug, Clone)]
pub struct StatementMapper<'a> {
    periodo: String,
    known: &'a KnownOperators,
}

impl<'a> StatementMapper<'a> {
    pub fn new(periodo: &str, known: &'a KnownOperators) -> Self {
        Self {
            periodo: periodo.to_string(),
            known,
        }
    }
}

impl RecordMapper for StatementMapper<'_> {
    type Record = FinancialStatement;
    const HEADER_CASE: HeaderCase = HeaderCase::Upper;

    fn required_columns(&self) -> &[&'static str] {
        &STATEMENT_REQUIRED
    }

    fn map_row(&self, row: &SourceRow<'_>) -> Result<FinancialStatement, RowRejection> {
        let registro_ans = row.text("REG_ANS", OPERATOR_KEY.max_chars);

        let Some(descricao) = row
            .text("DESCRICAO", STATEMENT_DESCRICAO.max_chars)
            .filter(|d| contains_any_keyword(d, &ACCEPTANCE_KEYWORDS))
        else {
            return Err(RowRejection::new(
                registro_ans,
                SkipReason::Filtered(format!(
                    "DESCRICAO matches none of {}",
                    ACCEPTANCE_KEYWORDS.join(", ")
                )),
            ));
        };

        let Some(registro_ans) = registro_ans else {
            return Err(RowRejection::new(
                None,
                SkipReason::ConstraintViolation("REG_ANS is null".into()),
            ));
        };
        if !self.known.contains(&registro_ans) {
            let reason =
                SkipReason::ConstraintViolation(format!("operator {registro_ans} is not registered"));
            return Err(RowRejection::new(Some(registro_ans), reason));
        }

        let Some(data) = row
            .raw("DATA")
            .and_then(|v| parse_date(v, STATEMENT_DATE_FORMAT))
        else {
            let reason = SkipReason::Parse(format!(
                "unparseable DATA {:?}",
                row.raw("DATA").unwrap_or_default()
            ));
            return Err(RowRejection::new(Some(registro_ans), reason));
        };

        let Some(valor) = row.raw("VL_SALDO_FINAL").and_then(parse_brl_amount) else {
            let reason = SkipReason::Parse(format!(
                "unparseable VL_SALDO_FINAL {:?}",
                row.raw("VL_SALDO_FINAL").unwrap_or_default()
            ));
            return Err(RowRejection::new(Some(registro_ans), reason));
        };

        Ok(FinancialStatement {
            data,
            registro_ans,
            conta: row.text("CD_CONTA_CONTABIL", STATEMENT_CONTA.max_chars),
            descricao,
            valor,
            periodo: self.periodo.clone(),
        })
    }
}

/// Lazy per-row outcomes for one pass over a [`RawTable`].
pub struct Rows<'a, M> {
    records: csv::StringRecordsIntoIter<&'a [u8]>,
    columns: ColumnIndex,
    mapper: M,
}

impl<M: RecordMapper> Iterator for Rows<'_, M> {
    type Item = RowOutcome<M::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.records.next()?;
        let outcome = match next {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                let row = SourceRow {
                    record: &record,
                    columns: &self.columns,
                    line,
                };
                match self.mapper.map_row(&row) {
                    Ok(mapped) => RowOutcome::Accepted(mapped),
                    Err(rejection) => RowOutcome::Skipped(RowSkip {
                        line,
                        registro_ans: rejection.registro_ans,
                        reason: rejection.reason,
                    }),
                }
            }
            Err(err) => RowOutcome::Skipped(RowSkip {
                line: err.position().map(|p| p.line()).unwrap_or_default(),
                registro_ans: None,
                reason: SkipReason::Parse(err.to_string()),
            }),
        };
        Some(outcome)
    }
}
