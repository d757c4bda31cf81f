//! Label encoders shared by the target variable and the categorical columns.
//!
//! Both directions are backed by the same sorted class list: a value's code
//! is its position in `classes`, and a code maps back to the class stored at
//! that position. Encoders are fitted offline and never mutated here.

use serde::{Deserialize, Serialize};

/// Errors raised when using an encoder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("encoder classes must be sorted and unique ({previous:?} precedes {next:?})")]
    UnsortedClasses { previous: String, next: String },

    #[error("encoder has no known classes")]
    NoClasses,

    #[error("class index {index} is out of range for {len} known classes")]
    IndexOutOfRange { index: usize, len: usize },
}

/// What to do with a categorical value the encoder was not fitted on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnseenCategoryPolicy {
    /// Substitute the first entry of the sorted class list, i.e. the
    /// lexicographically smallest known category.
    #[default]
    FirstKnownClass,
}

/// Result of encoding one categorical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    pub code: usize,
    /// `true` when the value was unseen and the policy picked a substitute.
    pub substituted: bool,
}

/// Bidirectional mapping between class labels and integer codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EncoderRepr", into = "EncoderRepr")]
pub struct LabelEncoder {
    classes: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct EncoderRepr {
    classes: Vec<String>,
}

impl TryFrom<EncoderRepr> for LabelEncoder {
    type Error = EncodingError;

    fn try_from(repr: EncoderRepr) -> Result<Self, Self::Error> {
        Self::new(repr.classes)
    }
}

impl From<LabelEncoder> for EncoderRepr {
    fn from(encoder: LabelEncoder) -> Self {
        Self {
            classes: encoder.classes,
        }
    }
}

impl LabelEncoder {
    /// Build an encoder from an already sorted, duplicate-free class list.
    pub fn new(classes: Vec<String>) -> Result<Self, EncodingError> {
        if let Some(pair) = classes.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(EncodingError::UnsortedClasses {
                previous: pair[0].clone(),
                next: pair[1].clone(),
            });
        }
        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.transform(value).is_some()
    }

    /// Code of a known value, `None` when the value was never seen.
    pub fn transform(&self, value: &str) -> Option<usize> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(value))
            .ok()
    }

    /// Encode `value`, applying `policy` when it is not a known class.
    pub fn transform_or_fallback(
        &self,
        value: &str,
        policy: UnseenCategoryPolicy,
    ) -> Result<Encoded, EncodingError> {
        if let Some(code) = self.transform(value) {
            return Ok(Encoded {
                code,
                substituted: false,
            });
        }
        match policy {
            UnseenCategoryPolicy::FirstKnownClass => {
                if self.classes.is_empty() {
                    return Err(EncodingError::NoClasses);
                }
                Ok(Encoded {
                    code: 0,
                    substituted: true,
                })
            }
        }
    }

    /// Label stored at `index`.
    pub fn inverse_transform(&self, index: usize) -> Result<&str, EncodingError> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(EncodingError::IndexOutOfRange {
                index,
                len: self.classes.len(),
            })
    }
}
