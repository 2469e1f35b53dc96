use futures::{FutureExt as _, future::BoxFuture};

use super::{
    AdditionalProperties, ArraySchema, DefaultValue, NumberSchema, ObjectSchema, Path, Schema,
    SchemaKind, StringSchema, ValidationError,
};
use crate::{
    reference::{ResolverChain, is_reference, resolve_reference},
    value::{Map, Value},
};

type Result<T> = core::result::Result<T, ValidationError>;

/// Validate and coerce `value` against `schema`, resolving references on
/// the way down.
///
/// `None` stands for an absent value, both as input and as output (an
/// optional schema with no value resolves to `None`).
///
/// # Errors
/// Returns the first [`ValidationError`] encountered; object `required`
/// checks and `oneOf` failures are collected before failing.
pub fn resolve<'a>(
    path: &'a Path,
    value: Option<Value>,
    schema: &'a Schema,
    resolvers: &'a ResolverChain,
) -> BoxFuture<'a, Result<Option<Value>>> {
    async move {
        let value = match value {
            Some(v) if is_reference(&v) => Some(
                resolve_reference(&v, resolvers)
                    .await
                    .map_err(|err| ValidationError::from_reference(path, err))?,
            ),
            other => other,
        };
        let Some(value) = value else {
            return absent(path, schema);
        };

        match &schema.kind {
            SchemaKind::Any => Ok(Some(value)),
            SchemaKind::OneOf(alternatives) => {
                one_of(path, value, alternatives, resolvers).await
            }
            SchemaKind::String(spec) => string(path, value, schema, spec),
            SchemaKind::Number(spec) => number(path, &value, spec).map(Some),
            SchemaKind::Boolean => match value {
                Value::Bool(_) => Ok(Some(value)),
                other => Err(ValidationError::InputNotBoolean {
                    path: path.clone(),
                    actual: other.type_name(),
                }),
            },
            SchemaKind::Array(spec) => array(path, value, spec, resolvers).await.map(Some),
            SchemaKind::Object(spec) => object(path, value, spec, resolvers).await.map(Some),
            SchemaKind::Stream => match value {
                Value::Stream(_) => Ok(Some(value)),
                other => Err(ValidationError::InputNotStream {
                    path: path.clone(),
                    actual: other.type_name(),
                }),
            },
        }
    }
    .boxed()
}

fn absent(path: &Path, schema: &Schema) -> Result<Option<Value>> {
    match &schema.default {
        Some(DefaultValue::Trusted(generator)) => Ok(Some(generator())),
        Some(DefaultValue::Literal(value)) => Ok(Some(value.clone())),
        None if schema.optional => Ok(None),
        None => Err(ValidationError::InputRequired { path: path.clone() }),
    }
}

async fn one_of(
    path: &Path,
    value: Value,
    alternatives: &[Schema],
    resolvers: &ResolverChain,
) -> Result<Option<Value>> {
    let mut errors = Vec::with_capacity(alternatives.len());
    for alternative in alternatives {
        match resolve(path, Some(value.clone()), alternative, resolvers).await {
            Ok(resolved) => return Ok(resolved),
            Err(err) => errors.push(err),
        }
    }
    Err(ValidationError::InputNotOneOf {
        path: path.clone(),
        errors,
    })
}

fn string(path: &Path, value: Value, schema: &Schema, spec: &StringSchema) -> Result<Option<Value>> {
    let s = match value {
        Value::String(s) => s,
        other => {
            return Err(ValidationError::InputNotString {
                path: path.clone(),
                actual: other.type_name(),
            });
        }
    };
    // Empty text counts as "not provided".
    if s.is_empty() {
        return absent(path, schema);
    }
    if let Some(pattern) = &spec.pattern
        && !pattern.is_match(&s)
    {
        return Err(ValidationError::PatternMismatch {
            path: path.clone(),
            pattern: pattern.as_str().to_owned(),
        });
    }
    let length = s.chars().count();
    if let Some(min_length) = spec.min_length
        && length < min_length
    {
        return Err(ValidationError::StringTooShort {
            path: path.clone(),
            min_length,
            length,
        });
    }
    if let Some(max_length) = spec.max_length
        && length > max_length
    {
        return Err(ValidationError::StringTooLong {
            path: path.clone(),
            max_length,
            length,
        });
    }
    let value = Value::String(s);
    check_enum(path, &value, spec.enumeration.as_deref())?;
    Ok(Some(value))
}

fn check_enum(path: &Path, value: &Value, allowed: Option<&[Value]>) -> Result<()> {
    match allowed {
        Some(allowed) if !allowed.contains(value) => Err(ValidationError::NotInEnum {
            path: path.clone(),
            allowed: allowed.to_vec(),
        }),
        _ => Ok(()),
    }
}

fn number(path: &Path, value: &Value, spec: &NumberSchema) -> Result<Value> {
    let n = match value {
        Value::Number(n) => *n,
        other => coerce_number(other),
    };
    if !n.is_finite() {
        return Err(ValidationError::InputNotNumber {
            path: path.clone(),
            actual: value.type_name(),
        });
    }

    let too_small = |limit, exclusive| ValidationError::NumberTooSmall {
        path: path.clone(),
        value: n,
        limit,
        exclusive,
    };
    let too_large = |limit, exclusive| ValidationError::NumberTooLarge {
        path: path.clone(),
        value: n,
        limit,
        exclusive,
    };
    if let Some(limit) = spec.exclusive_minimum
        && n <= limit
    {
        return Err(too_small(limit, true));
    }
    if let Some(limit) = spec.exclusive_maximum
        && n >= limit
    {
        return Err(too_large(limit, true));
    }
    if let Some(limit) = spec.minimum
        && n < limit
    {
        return Err(too_small(limit, false));
    }
    if let Some(limit) = spec.maximum
        && n > limit
    {
        return Err(too_large(limit, false));
    }
    if let Some(multiple_of) = spec.multiple_of
        && multiple_of != 0.0
        && n % multiple_of != 0.0
    {
        return Err(ValidationError::NotMultipleOf {
            path: path.clone(),
            value: n,
            multiple_of,
        });
    }
    let value = Value::Number(n);
    check_enum(path, &value, spec.enumeration.as_deref())?;
    if spec.integer && n.fract() != 0.0 {
        return Err(ValidationError::NotInteger {
            path: path.clone(),
            value: n,
        });
    }
    Ok(value)
}

/// Permissive numeric conversion in the spirit of JavaScript's `Number()`.
fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => parse_numeric(s),
        Value::Array(items) => match items.as_slice() {
            [] => 0.0,
            [only] => coerce_element(only),
            _ => f64::NAN,
        },
        _ => f64::NAN,
    }
}

/// A lone array element goes through its string form first, so `[null]`
/// is `0` while `[true]` is `NaN`.
fn coerce_element(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Number(n) => *n,
        Value::String(s) => parse_numeric(s),
        Value::Array(_) => coerce_number(value),
        _ => f64::NAN,
    }
}

#[allow(clippy::cast_precision_loss)]
fn parse_numeric(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    let radix = |digits: &str, radix| {
        if digits.starts_with(['+', '-']) {
            return f64::NAN;
        }
        u64::from_str_radix(digits, radix).map_or(f64::NAN, |v| v as f64)
    };
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return radix(hex, 16);
    }
    if let Some(oct) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        return radix(oct, 8);
    }
    if let Some(bin) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        return radix(bin, 2);
    }
    // Rust accepts "inf"/"nan" spellings; they are non-finite and rejected anyway.
    t.parse::<f64>().unwrap_or(f64::NAN)
}

async fn array(
    path: &Path,
    value: Value,
    spec: &ArraySchema,
    resolvers: &ResolverChain,
) -> Result<Value> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(ValidationError::InputNotArray {
                path: path.clone(),
                actual: other.type_name(),
            });
        }
    };
    if let Some(min_items) = spec.min_items
        && items.len() < min_items
    {
        return Err(ValidationError::ArrayTooShort {
            path: path.clone(),
            min_items,
            length: items.len(),
        });
    }
    if let Some(max_items) = spec.max_items
        && items.len() > max_items
    {
        return Err(ValidationError::ArrayTooLong {
            path: path.clone(),
            max_items,
            length: items.len(),
        });
    }
    if spec.unique_items {
        let duplicates = duplicates(&items);
        if !duplicates.is_empty() {
            return Err(ValidationError::ArrayNotUnique {
                path: path.clone(),
                duplicates,
            });
        }
    }

    let resolved = futures::future::try_join_all(items.into_iter().enumerate().map(
        |(i, item)| async move {
            if is_reference(&item) {
                resolve_reference(&item, resolvers)
                    .await
                    .map_err(|err| ValidationError::from_reference(&path.index(i), err))
            } else {
                Ok(item)
            }
        },
    ))
    .await?;

    let permissive;
    let item_schema = if let Some(items) = &spec.items {
        items.as_ref()
    } else {
        permissive = Schema::any();
        &permissive
    };
    let flattened: Vec<Value> = if expects_nested(item_schema) {
        resolved
    } else {
        resolved
            .into_iter()
            .flat_map(|item| match item {
                Value::Array(inner) => inner,
                other => vec![other],
            })
            .collect()
    };

    let mut out = Vec::with_capacity(flattened.len());
    for (i, item) in flattened.into_iter().enumerate() {
        let item_path = path.index(i);
        let resolved = resolve(&item_path, Some(item), item_schema, resolvers).await?;
        out.push(resolved.unwrap_or(Value::Null));
    }
    Ok(Value::Array(out))
}

fn expects_nested(schema: &Schema) -> bool {
    match &schema.kind {
        SchemaKind::Array(_) => true,
        SchemaKind::OneOf(alternatives) => alternatives.iter().any(expects_nested),
        _ => false,
    }
}

/// Values occurring more than once, each reported once in first-seen order.
///
/// Compares with [`Value`]'s own equality so bytes never match their text
/// encoding and callables or streams only match themselves.
fn duplicates(items: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if items[..i].contains(item) && !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

async fn object(
    path: &Path,
    value: Value,
    spec: &ObjectSchema,
    resolvers: &ResolverChain,
) -> Result<Value> {
    let input = match value {
        Value::Object(input) => input,
        other => {
            return Err(ValidationError::InputNotObject {
                path: path.clone(),
                actual: other.type_name(),
            });
        }
    };
    let declared = spec.properties.as_ref();

    let mut result = Map::new();
    let mut missing = Vec::new();
    if let Some(properties) = declared {
        for (key, schema) in properties {
            let key_path = path.key(key);
            match resolve(&key_path, input.get(key).cloned(), schema, resolvers).await {
                Ok(Some(resolved)) => {
                    result.insert(key.clone(), resolved);
                }
                Ok(None) => {}
                Err(ValidationError::InputRequired { path: at }) if at == key_path => {
                    missing.push(key.clone());
                }
                Err(err) => return Err(err),
            }
        }
    }

    for key in &spec.required {
        let present = if declared.is_some() {
            result.contains_key(key)
        } else {
            input.contains_key(key)
        };
        if !present && !missing.contains(key) {
            missing.push(key.clone());
        }
    }
    if !missing.is_empty() {
        return Err(ValidationError::ObjectMissingProperties {
            path: path.clone(),
            missing,
        });
    }

    let extra: Vec<&String> = input
        .keys()
        .filter(|key| declared.is_none_or(|props| !props.contains_key(*key)))
        .collect();
    match &spec.additional {
        AdditionalProperties::Forbid if !extra.is_empty() => {
            return Err(ValidationError::ObjectExtraProperties {
                path: path.clone(),
                extra: extra.into_iter().cloned().collect(),
            });
        }
        AdditionalProperties::Forbid => {}
        AdditionalProperties::Schema(schema) => {
            merge_additional(path, &input, &extra, schema, resolvers, &mut result).await?;
        }
        AdditionalProperties::Allow => {
            merge_additional(path, &input, &extra, &Schema::any(), resolvers, &mut result)
                .await?;
        }
        AdditionalProperties::Unspecified => {
            if declared.is_none() {
                result.clone_from(&input);
            }
        }
    }

    if let Some(min_properties) = spec.min_properties
        && result.len() < min_properties
    {
        return Err(ValidationError::ObjectTooFewProperties {
            path: path.clone(),
            min_properties,
            count: result.len(),
        });
    }
    if let Some(max_properties) = spec.max_properties
        && result.len() > max_properties
    {
        return Err(ValidationError::ObjectTooManyProperties {
            path: path.clone(),
            max_properties,
            count: result.len(),
        });
    }
    Ok(Value::Object(result))
}

async fn merge_additional(
    path: &Path,
    input: &Map,
    extra: &[&String],
    schema: &Schema,
    resolvers: &ResolverChain,
    result: &mut Map,
) -> Result<()> {
    for key in extra {
        let key_path = path.key(key);
        if let Some(resolved) = resolve(&key_path, input.get(*key).cloned(), schema, resolvers).await? {
            result.insert((*key).clone(), resolved);
        }
    }
    Ok(())
}
