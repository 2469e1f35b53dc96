//! Symbolic references of the form `{"$ref": "#/<Type>/<Id>/<path...>"}`.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use crate::value::{Map, Value};

pub const REF_KEY: &str = "$ref";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("invalid reference format: {0:?}")]
    InvalidFormat(String),

    #[error("reference {0} could not be resolved")]
    Unresolved(String),
}

/// A parsed reference: `(type, id, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    ty: String,
    id: String,
    path: Vec<String>,
}

impl Reference {
    pub fn new<P, S>(ty: impl Into<String>, id: impl Into<String>, path: P) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ty: ty.into(),
            id: id.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse `#/<Type>/<Id>[/<segment>...]`. The leading slash after `#`
    /// is optional; type and id must be non-empty.
    ///
    /// # Errors
    /// Returns [`ReferenceError::InvalidFormat`] when the string does not
    /// name at least a type and an id.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let invalid = || ReferenceError::InvalidFormat(raw.to_owned());
        let body = raw.strip_prefix('#').ok_or_else(invalid)?;
        let body = body.strip_prefix('/').unwrap_or(body);
        let mut segments = body.split('/');
        let ty = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let id = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        Ok(Self::new(ty, id, segments))
    }

    /// Extract a reference from a `{"$ref": "#..."}` marker object.
    ///
    /// Returns `None` when the value is not a reference marker at all.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Result<Self, ReferenceError>> {
        marker(value).map(Self::parse)
    }

    #[must_use]
    pub fn ty(&self) -> &str {
        &self.ty
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The marker object form of this reference.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(REF_KEY.to_owned(), Value::String(self.to_string()));
        Value::Object(map)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#/{}/{}", self.ty, self.id)?;
        for segment in &self.path {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn marker(value: &Value) -> Option<&str> {
    match value.get(REF_KEY) {
        Some(Value::String(s)) if s.starts_with('#') => Some(s),
        _ => None,
    }
}

/// Whether `value` is an object carrying a `$ref` string that starts with `#`.
#[must_use]
pub fn is_reference(value: &Value) -> bool {
    marker(value).is_some()
}

/// Source of referenced values.
///
/// Returning `None` means "not mine"; any `Some`, including `Some(Null)` or a
/// falsy value, is a successful resolution.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, ty: &str, id: &str, path: &[String]) -> Option<Value>;
}

#[async_trait::async_trait]
impl<T: Resolver + ?Sized> Resolver for Arc<T> {
    async fn resolve(&self, ty: &str, id: &str, path: &[String]) -> Option<Value> {
        (**self).resolve(ty, id, path).await
    }
}

/// Ordered resolvers; the first to produce a value wins.
#[derive(Clone, Default)]
pub struct ResolverChain(Vec<Arc<dyn Resolver>>);

impl ResolverChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, resolver: impl Resolver + 'static) -> Self {
        self.push(resolver);
        self
    }

    pub fn push(&mut self, resolver: impl Resolver + 'static) {
        self.0.push(Arc::new(resolver));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Try each resolver in order.
    pub async fn lookup(&self, reference: &Reference) -> Option<Value> {
        for resolver in &self.0 {
            if let Some(value) = resolver
                .resolve(&reference.ty, &reference.id, &reference.path)
                .await
            {
                return Some(value);
            }
        }
        None
    }
}

impl fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResolverChain").field(&self.0.len()).finish()
    }
}

impl FromIterator<Arc<dyn Resolver>> for ResolverChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Resolver>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Resolve a reference marker through `resolvers`.
///
/// # Errors
/// [`ReferenceError::InvalidFormat`] if `value` is not a well-formed marker,
/// [`ReferenceError::Unresolved`] if no resolver produced a value.
pub async fn resolve_reference(
    value: &Value,
    resolvers: &ResolverChain,
) -> Result<Value, ReferenceError> {
    let raw = match value.get(REF_KEY) {
        Some(Value::String(s)) => s.as_str(),
        _ => return Err(ReferenceError::InvalidFormat(value.canonical_json())),
    };
    let reference = Reference::parse(raw)?;
    tracing::trace!(reference = %reference, "resolving reference");
    resolvers
        .lookup(&reference)
        .await
        .ok_or_else(|| ReferenceError::Unresolved(raw.to_owned()))
}

/// Walk `path` through objects (by key) and arrays (by index).
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolver over an in-memory table of values for one reference type.
#[derive(Debug, Clone)]
pub struct MapResolver {
    ty: String,
    entries: HashMap<String, Value>,
}

impl MapResolver {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(id, value);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(id.into(), value.into());
    }
}

#[async_trait::async_trait]
impl Resolver for MapResolver {
    async fn resolve(&self, ty: &str, id: &str, path: &[String]) -> Option<Value> {
        if ty != self.ty {
            return None;
        }
        self.entries
            .get(id)
            .and_then(|root| lookup_path(root, path))
            .cloned()
    }
}

/// Resolver backed by a closure.
pub struct FnResolver<F>(F);

impl<F> FnResolver<F>
where
    F: Fn(&str, &str, &[String]) -> Option<Value> + Send + Sync,
{
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait::async_trait]
impl<F> Resolver for FnResolver<F>
where
    F: Fn(&str, &str, &[String]) -> Option<Value> + Send + Sync,
{
    async fn resolve(&self, ty: &str, id: &str, path: &[String]) -> Option<Value> {
        (self.0)(ty, id, path)
    }
}
