//! Values in transit between the host and a sandbox worker thread.
//!
//! JS values never leave the worker; aggregates and functions cross as ids
//! into the worker's registry.

use bytes::Bytes;
use rquickjs::{
    Array, ArrayBuffer, Ctx, IntoJs as _, Object, TypedArray, Value, object::Filter,
};

use super::state;
use crate::value::Value as HostValue;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Object,
    Array,
}

#[derive(Debug, Clone)]
pub enum Wire {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<Wire>),
    Object(Vec<(String, Wire)>),
    /// Callable held in the worker registry.
    Function(u64),
    /// Object or array held in the worker registry.
    Aggregate(u64, AggregateKind),
    /// Back-edge to an ancestor found while copying.
    Cycle,
}

impl Wire {
    /// Plain data copy of a host value; functions map through `function_id`.
    pub fn encode(
        value: &HostValue,
        function_id: &impl Fn(&crate::deref::Callable) -> Result<u64, String>,
    ) -> Result<Self, String> {
        Ok(match value {
            HostValue::Null => Self::Null,
            HostValue::Bool(b) => Self::Bool(*b),
            HostValue::Number(n) => Self::Number(*n),
            HostValue::String(s) => Self::String(s.clone()),
            HostValue::Bytes(b) => Self::Bytes(b.clone()),
            HostValue::Array(items) => Self::Array(
                items
                    .iter()
                    .map(|item| Self::encode(item, function_id))
                    .collect::<Result<_, _>>()?,
            ),
            HostValue::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::encode(v, function_id)?)))
                    .collect::<Result<_, String>>()?,
            ),
            HostValue::Function(callable) => Self::Function(function_id(callable)?),
            HostValue::Stream(_) => {
                return Err("byte streams cannot be passed into the sandbox".to_owned());
            }
        })
    }

    /// Registry ids referenced anywhere in this value.
    pub fn held_refs(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        self.collect_refs(&mut ids);
        ids
    }

    fn collect_refs(&self, ids: &mut Vec<u64>) {
        match self {
            Self::Function(id) | Self::Aggregate(id, _) => {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
            Self::Array(items) => items.iter().for_each(|item| item.collect_refs(ids)),
            Self::Object(entries) => entries.iter().for_each(|(_, item)| item.collect_refs(ids)),
            _ => {}
        }
    }
}

pub fn to_js<'js>(ctx: &Ctx<'js>, wire: &Wire) -> rquickjs::Result<Value<'js>> {
    Ok(match wire {
        Wire::Null | Wire::Cycle => Value::new_null(ctx.clone()),
        Wire::Bool(b) => Value::new_bool(ctx.clone(), *b),
        Wire::Number(n) => number_to_js(ctx, *n)?,
        Wire::String(s) => s.as_str().into_js(ctx)?,
        Wire::Bytes(b) => ArrayBuffer::new(ctx.clone(), b.to_vec())?.into_value(),
        Wire::Array(items) => {
            let arr = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                arr.set(i, to_js(ctx, item)?)?;
            }
            arr.into_value()
        }
        Wire::Object(entries) => {
            let obj = Object::new(ctx.clone())?;
            for (key, item) in entries {
                obj.set(key.as_str(), to_js(ctx, item)?)?;
            }
            obj.into_value()
        }
        Wire::Function(id) | Wire::Aggregate(id, _) => state::restore(ctx, *id)?,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_js<'js>(ctx: &Ctx<'js>, n: f64) -> rquickjs::Result<Value<'js>> {
    if n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX) {
        (n as i32).into_js(ctx)
    } else {
        n.into_js(ctx)
    }
}

/// Copyable leaves: primitives and byte buffers.
fn leaf(value: &Value<'_>) -> rquickjs::Result<Option<Wire>> {
    if value.is_null() || value.is_undefined() {
        return Ok(Some(Wire::Null));
    }
    if let Some(b) = value.as_bool() {
        return Ok(Some(Wire::Bool(b)));
    }
    if let Some(i) = value.as_int() {
        return Ok(Some(Wire::Number(f64::from(i))));
    }
    if let Some(f) = value.as_float() {
        return Ok(Some(Wire::Number(f)));
    }
    if let Some(s) = value.as_string() {
        return Ok(Some(Wire::String(s.to_string()?)));
    }
    if let Some(buf) = ArrayBuffer::from_value(value.clone()) {
        let bytes = buf.as_bytes().map(Bytes::copy_from_slice).unwrap_or_default();
        return Ok(Some(Wire::Bytes(bytes)));
    }
    if let Ok(typed) = TypedArray::<u8>::from_value(value.clone()) {
        let bytes = typed
            .as_bytes()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        return Ok(Some(Wire::Bytes(bytes)));
    }
    Ok(None)
}

/// One-level conversion used for call results and property reads:
/// aggregates and functions stay in the sandbox and cross as ids.
pub fn shallow<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Wire> {
    if let Some(leaf) = leaf(&value)? {
        return Ok(leaf);
    }
    if value.is_function() {
        return Ok(Wire::Function(state::register(ctx, value)?));
    }
    if value.is_array() {
        return Ok(Wire::Aggregate(
            state::register(ctx, value)?,
            AggregateKind::Array,
        ));
    }
    if value.is_object() {
        return Ok(Wire::Aggregate(
            state::register(ctx, value)?,
            AggregateKind::Object,
        ));
    }
    // Symbols and other exotic primitives have no host counterpart.
    Ok(Wire::Null)
}

/// Structural copy of an aggregate. Nested functions are registered (once
/// per distinct function) and back-edges become [`Wire::Cycle`].
pub fn snapshot<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Wire> {
    Snapshot {
        ctx,
        ancestors: Vec::new(),
        functions: Vec::new(),
    }
    .copy(value, 0)
}

struct Snapshot<'a, 'js> {
    ctx: &'a Ctx<'js>,
    ancestors: Vec<Value<'js>>,
    functions: Vec<(Value<'js>, u64)>,
}

impl<'js> Snapshot<'_, 'js> {
    fn copy(&mut self, value: Value<'js>, depth: usize) -> rquickjs::Result<Wire> {
        if let Some(leaf) = leaf(&value)? {
            return Ok(leaf);
        }
        if value.is_function() {
            if let Some((_, id)) = self.functions.iter().find(|(f, _)| *f == value) {
                return Ok(Wire::Function(*id));
            }
            let id = state::register(self.ctx, value.clone())?;
            self.functions.push((value, id));
            return Ok(Wire::Function(id));
        }
        if !value.is_object() {
            return Ok(Wire::Null);
        }
        if self.ancestors.contains(&value) {
            tracing::debug!("cycle detected while copying sandbox value");
            return Ok(Wire::Cycle);
        }
        if depth >= MAX_DEPTH {
            return Err(rquickjs::Error::new_from_js_message(
                "value",
                "host value",
                "maximum copy depth exceeded",
            ));
        }

        self.ancestors.push(value.clone());
        let copied = if let Some(arr) = value.as_array() {
            let mut items = Vec::with_capacity(arr.len());
            for item in arr.iter::<Value<'js>>() {
                items.push(self.copy(item?, depth + 1)?);
            }
            Wire::Array(items)
        } else if let Some(obj) = value.as_object() {
            let mut entries = Vec::new();
            for entry in obj.own_props::<String, Value<'js>>(Filter::new().string().enum_only()) {
                let (key, item) = entry?;
                entries.push((key, self.copy(item, depth + 1)?));
            }
            Wire::Object(entries)
        } else {
            Wire::Null
        };
        self.ancestors.pop();
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_refs_walks_nested_values_once() {
        let wire = Wire::Object(vec![
            ("f".to_owned(), Wire::Function(3)),
            (
                "list".to_owned(),
                Wire::Array(vec![
                    Wire::Aggregate(5, AggregateKind::Array),
                    Wire::Function(3),
                    Wire::Cycle,
                ]),
            ),
            ("n".to_owned(), Wire::Number(1.0)),
        ]);
        assert_eq!(wire.held_refs(), vec![3, 5]);
        assert!(Wire::String("x".to_owned()).held_refs().is_empty());
    }
}
