//! Request-time feature alignment.
//!
//! Maps an arbitrary crash record onto the exact column order and the
//! categorical encodings the classifier was trained with:
//!
//! 1. every column that has an encoder and is present in the record is
//!    stringified, unseen categories are replaced according to
//!    [`UnseenCategoryPolicy`], and the result is replaced by its code;
//! 2. the record is reindexed onto the [`FeatureSchema`]: schema columns the
//!    record lacks become `0.0`, record fields outside the schema are dropped.
//!
//! The output width always equals the schema length.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::encoding::{EncodingError, LabelEncoder, UnseenCategoryPolicy};

/// Raw request body: field name to scalar value, no schema enforced.
pub type RawRecord = serde_json::Map<String, Value>;

/// Column encoders keyed by the categorical column they were fitted on.
pub type ColumnEncoders = BTreeMap<String, LabelEncoder>;

/// Errors raised while aligning a record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlignError {
    #[error("column {column:?}: {reason}")]
    MalformedValue { column: String, reason: String },

    #[error("column {column:?}: {source}")]
    Encoding {
        column: String,
        #[source]
        source: EncodingError,
    },
}

impl AlignError {
    fn malformed(column: &str, reason: impl Into<String>) -> Self {
        Self::MalformedValue {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}

/// Ordered list of the columns the classifier expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSchema(Vec<String>);

impl FeatureSchema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(columns.into_iter().map(Into::into).collect())
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.0.iter().position(|c| c == column)
    }
}

/// One aligned row: a value for every schema column, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow<'a> {
    schema: &'a FeatureSchema,
    values: Vec<f64>,
}

impl<'a> FeatureRow<'a> {
    pub fn schema(&self) -> &'a FeatureSchema {
        self.schema
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        self.schema.position(column).map(|idx| self.values[idx])
    }

    /// `(column, value)` pairs in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, f64)> + '_ {
        self.schema
            .columns()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

/// Align `record` onto `schema`, encoding categorical columns with `encoders`.
///
/// Failures are logged here and returned to the caller, which owns recovery.
pub fn preprocess_input<'a>(
    record: &RawRecord,
    encoders: &ColumnEncoders,
    schema: &'a FeatureSchema,
) -> Result<FeatureRow<'a>, AlignError> {
    align(record, encoders, schema).inspect_err(|err| {
        tracing::error!("Error in preprocessing input: {err}");
    })
}

fn align<'a>(
    record: &RawRecord,
    encoders: &ColumnEncoders,
    schema: &'a FeatureSchema,
) -> Result<FeatureRow<'a>, AlignError> {
    // Encoded before reindexing: an encoder failure fails the request even
    // when the schema drops the column.
    let mut codes: HashMap<&str, f64> = HashMap::with_capacity(encoders.len());
    for (column, encoder) in encoders {
        let Some(value) = record.get(column) else {
            continue;
        };
        let text = categorical_text(column, value)?;
        let encoded = encoder
            .transform_or_fallback(&text, UnseenCategoryPolicy::FirstKnownClass)
            .map_err(|source| AlignError::Encoding {
                column: column.clone(),
                source,
            })?;
        if encoded.substituted {
            tracing::debug!(
                column = column.as_str(),
                value = %text,
                "unseen category, substituted first known class"
            );
        }
        codes.insert(column.as_str(), encoded.code as f64);
    }

    let values = schema
        .columns()
        .iter()
        .map(|column| {
            if let Some(code) = codes.get(column.as_str()) {
                return Ok(*code);
            }
            match record.get(column) {
                Some(value) => numeric_value(column, value),
                None => Ok(0.0),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FeatureRow { schema, values })
}

/// Stringify a categorical value the way the offline pipeline did before
/// fitting its encoders.
fn categorical_text<'v>(column: &str, value: &'v Value) -> Result<Cow<'v, str>, AlignError> {
    match value {
        Value::String(s) => Ok(Cow::Borrowed(s.as_str())),
        Value::Bool(true) => Ok(Cow::Borrowed("True")),
        Value::Bool(false) => Ok(Cow::Borrowed("False")),
        Value::Null => Ok(Cow::Borrowed("None")),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Cow::Owned(i.to_string()))
            } else if let Some(u) = n.as_u64() {
                Ok(Cow::Owned(u.to_string()))
            } else {
                let f = n
                    .as_f64()
                    .ok_or_else(|| AlignError::malformed(column, "unrepresentable number"))?;
                Ok(Cow::Owned(format_float(f)))
            }
        }
        // Never a fitted class; left to the unseen-category policy.
        Value::Array(_) | Value::Object(_) => Ok(Cow::Owned(value.to_string())),
    }
}

/// Shortest round-trip form: positional inside `[1e-4, 1e16)`, otherwise
/// `<mantissa>e<sign><two or more digits>`; integral values keep a `.0`.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = f.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let text = format!("{f:e}");
        return match text.split_once('e') {
            Some((mantissa, exponent)) => match exponent.parse::<i32>() {
                Ok(exp) => {
                    let sign = if exp < 0 { '-' } else { '+' };
                    format!("{mantissa}e{sign}{:02}", exp.unsigned_abs())
                }
                Err(_) => text.clone(),
            },
            None => text.clone(),
        };
    }
    if f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn numeric_value(column: &str, value: &Value) -> Result<f64, AlignError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| AlignError::malformed(column, "unrepresentable number")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| AlignError::malformed(column, format!("{s:?} is not numeric"))),
        Value::Null => Err(AlignError::malformed(column, "missing value")),
        Value::Array(_) | Value::Object(_) => {
            Err(AlignError::malformed(column, "expected a numeric value"))
        }
    }
}
