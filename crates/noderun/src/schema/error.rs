use serde::Serialize;

use super::Path;
use crate::{reference::ReferenceError, value::Value};

/// Malformed schema document.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema must be an object or `true`")]
    NotAnObject,

    #[error("keyword `{keyword}` must be {expected}")]
    InvalidKeyword {
        keyword: &'static str,
        expected: &'static str,
    },

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Input rejected by the schema resolver.
///
/// Serializes as an object tagged by `kind`, carrying the offending `path`
/// and kind-specific details.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind")]
pub enum ValidationError {
    #[serde(rename = "required")]
    #[error("{path}: value is required")]
    InputRequired { path: Path },

    #[serde(rename = "not-string")]
    #[error("{path}: expected a string, got {actual}")]
    InputNotString { path: Path, actual: &'static str },

    #[serde(rename = "too-short")]
    #[error("{path}: string has {length} characters, fewer than {min_length}")]
    StringTooShort {
        path: Path,
        min_length: usize,
        length: usize,
    },

    #[serde(rename = "too-long")]
    #[error("{path}: string has {length} characters, more than {max_length}")]
    StringTooLong {
        path: Path,
        max_length: usize,
        length: usize,
    },

    #[serde(rename = "pattern-mismatch")]
    #[error("{path}: string does not match pattern {pattern:?}")]
    PatternMismatch { path: Path, pattern: String },

    #[serde(rename = "not-in-enum")]
    #[error("{path}: value is not one of the allowed values")]
    NotInEnum { path: Path, allowed: Vec<Value> },

    #[serde(rename = "not-number")]
    #[error("{path}: expected a number, got {actual}")]
    InputNotNumber { path: Path, actual: &'static str },

    #[serde(rename = "too-small")]
    #[error("{path}: {value} is below the {} {limit}", bound_name(.exclusive, "minimum"))]
    NumberTooSmall {
        path: Path,
        value: f64,
        limit: f64,
        exclusive: bool,
    },

    #[serde(rename = "too-large")]
    #[error("{path}: {value} is above the {} {limit}", bound_name(.exclusive, "maximum"))]
    NumberTooLarge {
        path: Path,
        value: f64,
        limit: f64,
        exclusive: bool,
    },

    #[serde(rename = "not-multiple-of")]
    #[error("{path}: {value} is not a multiple of {multiple_of}")]
    NotMultipleOf {
        path: Path,
        value: f64,
        multiple_of: f64,
    },

    #[serde(rename = "not-integer")]
    #[error("{path}: {value} is not an integer")]
    NotInteger { path: Path, value: f64 },

    #[serde(rename = "not-boolean")]
    #[error("{path}: expected a boolean, got {actual}")]
    InputNotBoolean { path: Path, actual: &'static str },

    #[serde(rename = "not-array")]
    #[error("{path}: expected an array, got {actual}")]
    InputNotArray { path: Path, actual: &'static str },

    #[serde(rename = "array-too-short")]
    #[error("{path}: array has {length} items, fewer than {min_items}")]
    ArrayTooShort {
        path: Path,
        min_items: usize,
        length: usize,
    },

    #[serde(rename = "array-too-long")]
    #[error("{path}: array has {length} items, more than {max_items}")]
    ArrayTooLong {
        path: Path,
        max_items: usize,
        length: usize,
    },

    #[serde(rename = "array-not-unique")]
    #[error("{path}: array contains {} duplicated values", .duplicates.len())]
    ArrayNotUnique { path: Path, duplicates: Vec<Value> },

    #[serde(rename = "not-object")]
    #[error("{path}: expected an object, got {actual}")]
    InputNotObject { path: Path, actual: &'static str },

    #[serde(rename = "object-too-few-properties")]
    #[error("{path}: object has {count} properties, fewer than {min_properties}")]
    ObjectTooFewProperties {
        path: Path,
        min_properties: usize,
        count: usize,
    },

    #[serde(rename = "object-too-many-properties")]
    #[error("{path}: object has {count} properties, more than {max_properties}")]
    ObjectTooManyProperties {
        path: Path,
        max_properties: usize,
        count: usize,
    },

    #[serde(rename = "object-extra-properties")]
    #[error("{path}: unexpected properties: {}", .extra.join(", "))]
    ObjectExtraProperties { path: Path, extra: Vec<String> },

    #[serde(rename = "object-missing-properties")]
    #[error("{path}: missing required properties: {}", .missing.join(", "))]
    ObjectMissingProperties { path: Path, missing: Vec<String> },

    #[serde(rename = "not-one-of")]
    #[error("{path}: value matches none of {} alternatives", .errors.len())]
    InputNotOneOf {
        path: Path,
        errors: Vec<ValidationError>,
    },

    #[serde(rename = "not-stream")]
    #[error("{path}: expected a stream, got {actual}")]
    InputNotStream { path: Path, actual: &'static str },

    #[serde(rename = "reference-unresolved")]
    #[error("{path}: reference {reference} could not be resolved")]
    ReferenceNotResolved { path: Path, reference: String },

    #[serde(rename = "reference-invalid-format")]
    #[error("{path}: invalid reference {reference:?}")]
    ReferenceInvalid { path: Path, reference: String },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn bound_name(exclusive: &bool, bound: &str) -> String {
    if *exclusive {
        format!("exclusive {bound}")
    } else {
        bound.to_owned()
    }
}

impl ValidationError {
    pub(crate) fn from_reference(path: &Path, err: ReferenceError) -> Self {
        match err {
            ReferenceError::Unresolved(reference) => Self::ReferenceNotResolved {
                path: path.clone(),
                reference,
            },
            ReferenceError::InvalidFormat(reference) => Self::ReferenceInvalid {
                path: path.clone(),
                reference,
            },
        }
    }

    /// Stable machine-readable kind, identical to the serialized `kind` tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InputRequired { .. } => "required",
            Self::InputNotString { .. } => "not-string",
            Self::StringTooShort { .. } => "too-short",
            Self::StringTooLong { .. } => "too-long",
            Self::PatternMismatch { .. } => "pattern-mismatch",
            Self::NotInEnum { .. } => "not-in-enum",
            Self::InputNotNumber { .. } => "not-number",
            Self::NumberTooSmall { .. } => "too-small",
            Self::NumberTooLarge { .. } => "too-large",
            Self::NotMultipleOf { .. } => "not-multiple-of",
            Self::NotInteger { .. } => "not-integer",
            Self::InputNotBoolean { .. } => "not-boolean",
            Self::InputNotArray { .. } => "not-array",
            Self::ArrayTooShort { .. } => "array-too-short",
            Self::ArrayTooLong { .. } => "array-too-long",
            Self::ArrayNotUnique { .. } => "array-not-unique",
            Self::InputNotObject { .. } => "not-object",
            Self::ObjectTooFewProperties { .. } => "object-too-few-properties",
            Self::ObjectTooManyProperties { .. } => "object-too-many-properties",
            Self::ObjectExtraProperties { .. } => "object-extra-properties",
            Self::ObjectMissingProperties { .. } => "object-missing-properties",
            Self::InputNotOneOf { .. } => "not-one-of",
            Self::InputNotStream { .. } => "not-stream",
            Self::ReferenceNotResolved { .. } => "reference-unresolved",
            Self::ReferenceInvalid { .. } => "reference-invalid-format",
        }
    }

    #[must_use]
    pub const fn path(&self) -> &Path {
        match self {
            Self::InputRequired { path }
            | Self::InputNotString { path, .. }
            | Self::StringTooShort { path, .. }
            | Self::StringTooLong { path, .. }
            | Self::PatternMismatch { path, .. }
            | Self::NotInEnum { path, .. }
            | Self::InputNotNumber { path, .. }
            | Self::NumberTooSmall { path, .. }
            | Self::NumberTooLarge { path, .. }
            | Self::NotMultipleOf { path, .. }
            | Self::NotInteger { path, .. }
            | Self::InputNotBoolean { path, .. }
            | Self::InputNotArray { path, .. }
            | Self::ArrayTooShort { path, .. }
            | Self::ArrayTooLong { path, .. }
            | Self::ArrayNotUnique { path, .. }
            | Self::InputNotObject { path, .. }
            | Self::ObjectTooFewProperties { path, .. }
            | Self::ObjectTooManyProperties { path, .. }
            | Self::ObjectExtraProperties { path, .. }
            | Self::ObjectMissingProperties { path, .. }
            | Self::InputNotOneOf { path, .. }
            | Self::InputNotStream { path, .. }
            | Self::ReferenceNotResolved { path, .. }
            | Self::ReferenceInvalid { path, .. } => path,
        }
    }
}
