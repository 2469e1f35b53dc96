//! Isolated execution contexts backed by QuickJS.
//!
//! Each [`ExecutionContext`] owns one interpreter running on its own thread.
//! Arguments are copied in; results come back as [`Remote`] values that
//! either carry copied data or a [`LazyRef`] to something that stayed
//! inside the sandbox.

mod alloc;
mod bridge;
mod error;
mod handle;
mod state;
mod wire;
mod worker;

use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::mpsc;

pub use error::{ExecutionError, Result};
pub use handle::{LazyRef, RefKind, Remote};

use self::{
    bridge::Bridge,
    handle::{Guard, Link},
    state::ENTRY_REF,
};
use crate::{
    deref::Callable,
    host::Host,
    net::{AllowAllPolicy, NetworkPolicy},
    shims::ShimSet,
    value::Value,
};

pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct SandboxOptions {
    /// Heap limit of the interpreter in bytes.
    pub memory_limit: usize,
    /// Wall-clock bound of a single call, including time spent awaiting.
    pub timeout: Duration,
    pub max_stack_size: usize,
    /// Upper bound for a fetched response body read into the sandbox.
    pub max_body_bytes: usize,
    pub shims: ShimSet,
    /// Invoked on the worker thread when the context fails fatally.
    pub on_fatal: Option<FatalHandler>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shims: ShimSet::default(),
            on_fatal: None,
        }
    }
}

impl fmt::Debug for SandboxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxOptions")
            .field("memory_limit", &self.memory_limit)
            .field("timeout", &self.timeout)
            .field("max_stack_size", &self.max_stack_size)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("shims", &self.shims)
            .field("on_fatal", &self.on_fatal.is_some())
            .finish()
    }
}

/// What a context exposes as its callable entry point.
#[derive(Debug, Clone)]
pub enum Entry {
    /// Source of a function expression, e.g. `(n) => n * 2`.
    Expression(String),
    /// A script defining a global function, and that function's name.
    Global { script: String, name: String },
}

impl Entry {
    pub fn expression(source: impl Into<String>) -> Self {
        Self::Expression(source.into())
    }

    pub fn global(script: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Global {
            script: script.into(),
            name: name.into(),
        }
    }
}

#[derive(Clone)]
pub struct SandboxBuilder {
    options: SandboxOptions,
    host: Option<Arc<dyn Host>>,
    policy: Arc<dyn NetworkPolicy>,
}

impl fmt::Debug for SandboxBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxBuilder")
            .field("options", &self.options)
            .field("host", &self.host.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: SandboxOptions::default(),
            host: None,
            policy: Arc::new(AllowAllPolicy),
        }
    }

    #[must_use]
    pub fn options(mut self, options: SandboxOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.options.memory_limit = bytes;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    #[must_use]
    pub fn shims(mut self, shims: ShimSet) -> Self {
        self.options.shims = shims;
        self
    }

    #[must_use]
    pub fn on_fatal(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.options.on_fatal = Some(Arc::new(handler));
        self
    }

    /// Host used to perform bridged fetches. Without one, `fetch` rejects.
    #[must_use]
    pub fn host(mut self, host: impl Host) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: impl NetworkPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    #[must_use]
    pub const fn sandbox_options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Start a context and compile `entry` inside it.
    ///
    /// # Errors
    /// Returns [`ExecutionError::Compile`] if the entry does not evaluate to
    /// a function, [`ExecutionError::Timeout`] if evaluating it runs past the
    /// timeout, and [`ExecutionError::Internal`] outside a tokio runtime.
    pub async fn build(&self, entry: Entry) -> Result<ExecutionContext> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ExecutionError::Internal(format!("no tokio runtime: {e}")))?;

        let guard = Arc::new(Guard::new());
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (commands, ready) =
            worker::spawn(self.options.clone(), entry, guard.clone(), host_tx)?;

        let bridge = Bridge::new(
            self.host.clone(),
            self.policy.clone(),
            self.options.max_body_bytes,
            commands.clone(),
        );
        runtime.spawn(bridge.serve(host_rx, guard.token.clone()));

        let link = Arc::new(Link::new(commands, guard));
        match ready.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                link.dispose();
                return Err(err);
            }
            Err(_) => {
                link.dispose();
                return Err(link.closed_error());
            }
        }

        tracing::debug!("execution context ready");
        Ok(ExecutionContext {
            entry: LazyRef::new(ENTRY_REF, RefKind::Function, &link),
            link,
        })
    }
}

/// A live sandbox with one compiled entry point.
///
/// Dropping the context disposes it.
#[derive(Debug)]
pub struct ExecutionContext {
    entry: LazyRef,
    link: Arc<Link>,
}

impl ExecutionContext {
    /// Invoke the entry point. The call always completes asynchronously,
    /// even for synchronous functions.
    ///
    /// # Errors
    /// See [`LazyRef::call`].
    pub async fn call(&self, args: Vec<Value>) -> Result<Remote> {
        self.entry.call(args).await
    }

    /// The entry point as a host callable.
    #[must_use]
    pub fn entry(&self) -> Callable {
        Callable::from(self.entry.clone())
    }

    /// Tear the context down, failing any pending call. No-op once disposed.
    pub fn dispose(&self) {
        self.link.dispose();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.link.is_closed()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.link.dispose();
    }
}
