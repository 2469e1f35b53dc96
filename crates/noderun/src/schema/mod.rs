//! Schema descriptors and the reference-aware resolver.

mod error;
mod path;
mod resolve;

use std::{collections::BTreeMap, fmt, sync::Arc};

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value as Json;

use crate::value::Value;

pub use error::{SchemaError, ValidationError};
pub use path::Path;
pub use resolve::resolve;

/// Zero-argument default producer; only constructible from Rust.
pub type Generator = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Clone)]
pub enum DefaultValue {
    Literal(Value),
    Trusted(Generator),
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Self::Trusted(_) => f.write_str("Trusted(..)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Schema {
    pub kind: SchemaKind,
    pub default: Option<DefaultValue>,
    pub optional: bool,
}

#[derive(Clone, Debug)]
pub enum SchemaKind {
    Any,
    String(StringSchema),
    Number(NumberSchema),
    Boolean,
    Array(ArraySchema),
    Object(ObjectSchema),
    Stream,
    OneOf(Vec<Schema>),
}

#[derive(Clone, Debug, Default)]
pub struct StringSchema {
    pub pattern: Option<Regex>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub enumeration: Option<Vec<Value>>,
}

#[derive(Clone, Debug, Default)]
pub struct NumberSchema {
    pub integer: bool,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub exclusive_minimum: Option<f64>,
    pub exclusive_maximum: Option<f64>,
    pub multiple_of: Option<f64>,
    pub enumeration: Option<Vec<Value>>,
}

#[derive(Clone, Debug, Default)]
pub struct ArraySchema {
    pub items: Option<Box<Schema>>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub unique_items: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ObjectSchema {
    /// `None` means the object is passed through as a shallow copy.
    pub properties: Option<BTreeMap<String, Schema>>,
    pub required: Vec<String>,
    pub additional: AdditionalProperties,
    pub min_properties: Option<usize>,
    pub max_properties: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub enum AdditionalProperties {
    /// Keyword absent: undeclared keys are dropped when `properties` is set.
    #[default]
    Unspecified,
    Allow,
    Forbid,
    Schema(Box<Schema>),
}

impl Schema {
    #[must_use]
    pub const fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            default: None,
            optional: false,
        }
    }

    #[must_use]
    pub const fn any() -> Self {
        Self::new(SchemaKind::Any)
    }

    #[must_use]
    pub fn string() -> Self {
        Self::new(SchemaKind::String(StringSchema::default()))
    }

    #[must_use]
    pub fn number() -> Self {
        Self::new(SchemaKind::Number(NumberSchema::default()))
    }

    #[must_use]
    pub fn integer() -> Self {
        Self::new(SchemaKind::Number(NumberSchema {
            integer: true,
            ..NumberSchema::default()
        }))
    }

    #[must_use]
    pub const fn boolean() -> Self {
        Self::new(SchemaKind::Boolean)
    }

    #[must_use]
    pub const fn stream() -> Self {
        Self::new(SchemaKind::Stream)
    }

    #[must_use]
    pub fn array(items: Self) -> Self {
        Self::new(SchemaKind::Array(ArraySchema {
            items: Some(Box::new(items)),
            ..ArraySchema::default()
        }))
    }

    #[must_use]
    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Self)>,
        K: Into<String>,
    {
        Self::new(SchemaKind::Object(ObjectSchema {
            properties: Some(properties.into_iter().map(|(k, s)| (k.into(), s)).collect()),
            ..ObjectSchema::default()
        }))
    }

    #[must_use]
    pub const fn one_of(alternatives: Vec<Self>) -> Self {
        Self::new(SchemaKind::OneOf(alternatives))
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Literal(value.into()));
        self
    }

    /// Attach a trusted default generator, run once per absent value.
    #[must_use]
    pub fn with_generator(mut self, generator: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Trusted(Arc::new(generator)));
        self
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Neither a default nor `optional`: absence is an error.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.default.is_none() && !self.optional
    }

    /// Parse a JSON schema descriptor.
    ///
    /// Unknown or missing `type` yields [`SchemaKind::Any`]. `oneOf` and
    /// `anyOf` are treated alike and take precedence over `type`.
    ///
    /// # Errors
    /// Returns [`SchemaError`] for malformed keywords or invalid patterns.
    pub fn from_json(json: &Json) -> Result<Self, SchemaError> {
        let obj = match json {
            Json::Object(obj) => obj,
            Json::Bool(true) => return Ok(Self::any()),
            _ => return Err(SchemaError::NotAnObject),
        };

        let kind = if let Some(alternatives) = obj.get("oneOf").or_else(|| obj.get("anyOf")) {
            let Json::Array(alternatives) = alternatives else {
                return Err(SchemaError::InvalidKeyword {
                    keyword: "oneOf",
                    expected: "an array of schemas",
                });
            };
            SchemaKind::OneOf(
                alternatives
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            )
        } else {
            match obj.get("type").and_then(Json::as_str) {
                Some("string") => SchemaKind::String(parse_string(obj)?),
                Some("number") => SchemaKind::Number(parse_number(obj, false)?),
                Some("integer") => SchemaKind::Number(parse_number(obj, true)?),
                Some("boolean") => SchemaKind::Boolean,
                Some("array") => SchemaKind::Array(parse_array(obj)?),
                Some("object") => SchemaKind::Object(parse_object(obj)?),
                Some("stream") => SchemaKind::Stream,
                _ => SchemaKind::Any,
            }
        };

        Ok(Self {
            kind,
            default: obj.get("default").map(|d| DefaultValue::Literal(Value::from(d))),
            optional: flag(obj, "optional")?,
        })
    }
}

type JsonMap = serde_json::Map<String, Json>;

fn flag(obj: &JsonMap, keyword: &'static str) -> Result<bool, SchemaError> {
    match obj.get(keyword) {
        None => Ok(false),
        Some(Json::Bool(b)) => Ok(*b),
        Some(_) => Err(SchemaError::InvalidKeyword {
            keyword,
            expected: "a boolean",
        }),
    }
}

fn count(obj: &JsonMap, keyword: &'static str) -> Result<Option<usize>, SchemaError> {
    obj.get(keyword)
        .map(|v| {
            v.as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or(SchemaError::InvalidKeyword {
                    keyword,
                    expected: "a non-negative integer",
                })
        })
        .transpose()
}

fn number(obj: &JsonMap, keyword: &'static str) -> Result<Option<f64>, SchemaError> {
    obj.get(keyword)
        .map(|v| {
            v.as_f64().ok_or(SchemaError::InvalidKeyword {
                keyword,
                expected: "a number",
            })
        })
        .transpose()
}

fn enumeration(obj: &JsonMap) -> Result<Option<Vec<Value>>, SchemaError> {
    match obj.get("enum") {
        None => Ok(None),
        Some(Json::Array(items)) => Ok(Some(items.iter().map(Value::from).collect())),
        Some(_) => Err(SchemaError::InvalidKeyword {
            keyword: "enum",
            expected: "an array",
        }),
    }
}

fn parse_string(obj: &JsonMap) -> Result<StringSchema, SchemaError> {
    let pattern = match obj.get("pattern") {
        None => None,
        Some(Json::String(p)) => Some(Regex::new(p).map_err(|source| {
            SchemaError::InvalidPattern {
                pattern: p.clone(),
                source,
            }
        })?),
        Some(_) => {
            return Err(SchemaError::InvalidKeyword {
                keyword: "pattern",
                expected: "a string",
            });
        }
    };
    Ok(StringSchema {
        pattern,
        min_length: count(obj, "minLength")?,
        max_length: count(obj, "maxLength")?,
        enumeration: enumeration(obj)?,
    })
}

fn parse_number(obj: &JsonMap, integer: bool) -> Result<NumberSchema, SchemaError> {
    Ok(NumberSchema {
        integer,
        minimum: number(obj, "minimum")?,
        maximum: number(obj, "maximum")?,
        exclusive_minimum: number(obj, "exclusiveMinimum")?,
        exclusive_maximum: number(obj, "exclusiveMaximum")?,
        multiple_of: number(obj, "multipleOf")?,
        enumeration: enumeration(obj)?,
    })
}

fn parse_array(obj: &JsonMap) -> Result<ArraySchema, SchemaError> {
    Ok(ArraySchema {
        items: obj
            .get("items")
            .map(Schema::from_json)
            .transpose()?
            .map(Box::new),
        min_items: count(obj, "minItems")?,
        max_items: count(obj, "maxItems")?,
        unique_items: flag(obj, "uniqueItems")?,
    })
}

fn parse_object(obj: &JsonMap) -> Result<ObjectSchema, SchemaError> {
    let properties = match obj.get("properties") {
        None => None,
        Some(Json::Object(props)) => Some(
            props
                .iter()
                .map(|(k, v)| Ok((k.clone(), Schema::from_json(v)?)))
                .collect::<Result<_, SchemaError>>()?,
        ),
        Some(_) => {
            return Err(SchemaError::InvalidKeyword {
                keyword: "properties",
                expected: "an object",
            });
        }
    };
    let required = match obj.get("required") {
        None => Vec::new(),
        Some(Json::Array(keys)) => keys
            .iter()
            .map(|k| {
                k.as_str().map(str::to_owned).ok_or(SchemaError::InvalidKeyword {
                    keyword: "required",
                    expected: "an array of strings",
                })
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(SchemaError::InvalidKeyword {
                keyword: "required",
                expected: "an array of strings",
            });
        }
    };
    let additional = match obj.get("additionalProperties") {
        None => AdditionalProperties::Unspecified,
        Some(Json::Bool(true)) => AdditionalProperties::Allow,
        Some(Json::Bool(false)) => AdditionalProperties::Forbid,
        Some(schema) => AdditionalProperties::Schema(Box::new(Schema::from_json(schema)?)),
    };
    Ok(ObjectSchema {
        properties,
        required,
        additional,
        min_properties: count(obj, "minProperties")?,
        max_properties: count(obj, "maxProperties")?,
    })
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Self::from_json(&json).map_err(serde::de::Error::custom)
    }
}
