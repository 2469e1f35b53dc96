pub mod config;
pub mod deref;
pub mod exec;
pub mod host;
pub mod net;
pub mod reference;
pub mod sandbox;
pub mod schema;
pub mod shims;
pub mod value;

/// Tracing target of `console.*` output from sandboxed scripts.
pub const TRACE_TARGET_SCRIPT: &str = "noderun::script";

pub use config::{Config, ConfigError};
pub use deref::{Callable, deref};
pub use exec::{Invocation, InvocationState, NodeError, NodeExecutor, NodeSpec};
#[cfg(feature = "request")]
pub use host::ReqwestHost;
pub use host::{BoxError, BoxedStream, Host, HttpBodyStream, HttpRequest, HttpResponse};
pub use net::{AllowAllPolicy, NetworkPolicy, PublicOnlyPolicy};
pub use reference::{
    FnResolver, MapResolver, Reference, ReferenceError, Resolver, ResolverChain, is_reference,
    resolve_reference,
};
pub use sandbox::{
    Entry, ExecutionContext, ExecutionError, LazyRef, RefKind, Remote, SandboxBuilder,
    SandboxOptions,
};
pub use schema::{Path, Schema, SchemaError, ValidationError, resolve};
pub use shims::ShimSet;
pub use value::{ByteStream, Map, Value};
