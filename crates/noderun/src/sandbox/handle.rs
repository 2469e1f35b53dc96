//! Host-side handles into a running sandbox worker.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    time::Instant,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{
    error::{ExecutionError, Result},
    state::{ENTRY_REF, Reply},
    wire::{AggregateKind, Wire},
    worker::Command,
};
use crate::{deref::Callable, value::Value};

/// State shared between the host handles, the worker's interrupt handler
/// and the fetch bridge of one execution context.
#[derive(Debug, Default)]
pub struct Guard {
    pub(crate) token: CancellationToken,
    call_deadline: Mutex<Option<Instant>>,
    op_deadline: Mutex<Option<Instant>>,
    fatal: Mutex<Option<String>>,
    memory_exhausted: AtomicBool,
}

impl Guard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_call_deadline(&self, deadline: Option<Instant>) {
        *self.call_deadline.lock() = deadline;
    }

    pub fn set_op_deadline(&self, deadline: Option<Instant>) {
        *self.op_deadline.lock() = deadline;
    }

    pub fn deadline_passed(&self, now: Instant) -> bool {
        let passed = |d: Option<Instant>| d.is_some_and(|d| d <= now);
        passed(*self.call_deadline.lock()) || passed(*self.op_deadline.lock())
    }

    /// Polled by the interpreter while script code runs.
    pub fn should_interrupt(&self) -> bool {
        self.token.is_cancelled()
            || self.memory_exhausted()
            || self.deadline_passed(Instant::now())
    }

    /// Set by the heap budget when it refuses an allocation.
    pub fn note_memory_exhausted(&self) {
        self.memory_exhausted.store(true, Ordering::Release);
    }

    pub fn memory_exhausted(&self) -> bool {
        self.memory_exhausted.load(Ordering::Acquire)
    }

    pub fn set_fatal(&self, message: &str) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(message.to_owned());
        }
    }

    pub fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Error reported to anyone still talking to a context that is gone.
    pub fn closed_error(&self) -> ExecutionError {
        self.fatal()
            .map_or(ExecutionError::Disposed, |message| ExecutionError::Fatal {
                message,
            })
    }
}

/// Command channel to one worker. The worker is torn down once the last
/// handle sharing the link is dropped.
pub struct Link {
    commands: Sender<Command>,
    guard: Arc<Guard>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Link {
    pub const fn new(commands: Sender<Command>, guard: Arc<Guard>) -> Self {
        Self { commands, guard }
    }

    pub fn is_closed(&self) -> bool {
        self.guard.token.is_cancelled()
    }

    pub fn closed_error(&self) -> ExecutionError {
        self.guard.closed_error()
    }

    /// Tear the worker down. Safe to call any number of times.
    pub fn dispose(&self) {
        if !self.guard.token.is_cancelled() {
            tracing::debug!("disposing execution context");
        }
        self.guard.token.cancel();
        let _ = self.commands.send(Command::Dispose);
    }

    /// Send a command and wait for its reply, failing as soon as the
    /// context is torn down even if the worker never answers.
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<Wire> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).is_err() {
            return Err(self.closed_error());
        }
        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or_else(|_| Err(self.closed_error())),
            () = self.guard.token.cancelled() => Err(self.closed_error()),
        }
    }

    fn release(&self, id: u64) {
        if !self.is_closed() {
            let _ = self.commands.send(Command::Release { id });
        }
    }

    fn remote(self: &Arc<Self>, wire: Wire) -> Remote {
        match wire {
            Wire::Function(id) => Remote::Function(LazyRef::new(id, RefKind::Function, self)),
            Wire::Aggregate(id, kind) => Remote::Aggregate(LazyRef::new(id, kind.into(), self)),
            other => Remote::Copied(self.materialize(other, &mut HashMap::new())),
        }
    }

    /// Turn a copied value tree into host values. Ids seen more than once
    /// in the same tree share a single lazy reference.
    fn materialize(self: &Arc<Self>, wire: Wire, seen: &mut HashMap<u64, LazyRef>) -> Value {
        match wire {
            Wire::Null | Wire::Cycle => Value::Null,
            Wire::Bool(b) => Value::Bool(b),
            Wire::Number(n) => Value::Number(n),
            Wire::String(s) => Value::String(s),
            Wire::Bytes(b) => Value::Bytes(b),
            Wire::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.materialize(item, seen))
                    .collect(),
            ),
            Wire::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, self.materialize(v, seen)))
                    .collect(),
            ),
            Wire::Function(id) => {
                let reference = seen
                    .entry(id)
                    .or_insert_with(|| LazyRef::new(id, RefKind::Function, self))
                    .clone();
                Value::Function(Callable::from(reference))
            }
            Wire::Aggregate(id, _) => {
                // Snapshots copy aggregates; a stray id is released unread.
                self.release(id);
                Value::Null
            }
        }
    }

    fn encode(self: &Arc<Self>, args: &[Value]) -> Result<Vec<Wire>> {
        let function_id = |callable: &Callable| {
            let reference = callable.reference();
            if Arc::ptr_eq(&reference.0.link, self) {
                Ok(reference.0.id)
            } else {
                Err("function belongs to another execution context".to_owned())
            }
        };
        args.iter()
            .map(|arg| Wire::encode(arg, &function_id))
            .collect::<core::result::Result<_, _>>()
            .map_err(ExecutionError::Transfer)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Function,
    Object,
    Array,
}

impl From<AggregateKind> for RefKind {
    fn from(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Object => Self::Object,
            AggregateKind::Array => Self::Array,
        }
    }
}

struct RefSlot {
    id: u64,
    kind: RefKind,
    link: Arc<Link>,
}

impl Drop for RefSlot {
    fn drop(&mut self) {
        if self.id != ENTRY_REF {
            self.link.release(self.id);
        }
    }
}

/// Handle to a value that still lives inside an execution context.
///
/// Holding one does not keep the context alive; once the context is
/// disposed every operation fails with [`ExecutionError::Disposed`].
#[derive(Clone)]
pub struct LazyRef(Arc<RefSlot>);

impl fmt::Debug for LazyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRef")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .finish()
    }
}

impl LazyRef {
    pub(crate) fn new(id: u64, kind: RefKind, link: &Arc<Link>) -> Self {
        Self(Arc::new(RefSlot {
            id,
            kind,
            link: link.clone(),
        }))
    }

    #[must_use]
    pub fn kind(&self) -> RefKind {
        self.0.kind
    }

    /// Whether both handles point at the same sandbox slot.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.0.link.is_closed()
    }

    /// Copy `args` into the sandbox and invoke the referenced function.
    ///
    /// # Errors
    /// Fails when the arguments cannot cross the boundary, when the call
    /// throws or times out, or when the context is gone.
    pub async fn call(&self, args: Vec<Value>) -> Result<Remote> {
        let link = &self.0.link;
        let args = link.encode(&args)?;
        let target = self.0.id;
        let wire = link
            .request(|reply| Command::Call {
                target,
                args,
                reply,
            })
            .await?;
        Ok(link.remote(wire))
    }

    /// Read a single property of the referenced value.
    ///
    /// # Errors
    /// Fails when the property getter throws or the context is gone.
    pub async fn get(&self, key: &str) -> Result<Remote> {
        let link = &self.0.link;
        let id = self.0.id;
        let key = key.to_owned();
        let wire = link
            .request(|reply| Command::Property { id, key, reply })
            .await?;
        Ok(link.remote(wire))
    }

    /// Structural copy of the referenced value. Nested functions become
    /// [`Callable`]s and cycles are cut with `null`.
    ///
    /// # Errors
    /// Fails when a getter throws, the value is nested too deeply, or the
    /// context is gone.
    pub async fn snapshot(&self) -> Result<Value> {
        let link = &self.0.link;
        let id = self.0.id;
        let wire = link.request(|reply| Command::Snapshot { id, reply }).await?;
        Ok(link.materialize(wire, &mut HashMap::new()))
    }
}

/// Result of a sandbox call or property read.
#[derive(Debug, Clone)]
pub enum Remote {
    /// Plain data, already copied to the host.
    Copied(Value),
    Function(LazyRef),
    /// Object or array left in the sandbox.
    Aggregate(LazyRef),
}

impl From<Value> for Remote {
    fn from(value: Value) -> Self {
        Self::Copied(value)
    }
}

impl From<LazyRef> for Remote {
    fn from(reference: LazyRef) -> Self {
        match reference.kind() {
            RefKind::Function => Self::Function(reference),
            RefKind::Object | RefKind::Array => Self::Aggregate(reference),
        }
    }
}
