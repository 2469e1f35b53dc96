//! The thread that owns one QuickJS runtime.
//!
//! Every interaction with the interpreter happens here; the host side only
//! sends [`Command`]s and waits on oneshot replies.

use std::{
    sync::{
        Arc,
        mpsc::{Receiver, RecvTimeoutError, Sender},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use rquickjs::{
    ArrayBuffer, Context, Ctx, Function, Object, Runtime, TypedArray, Value, function::Args,
};
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use super::{
    Entry, FatalHandler, SandboxOptions,
    alloc::Budget,
    bridge::{BodyMode, FetchRequest, HostRequest},
    error::{ExecutionError, Result},
    handle::Guard,
    state::{self, Reply},
    wire::{self, Wire},
};
use crate::{TRACE_TARGET_SCRIPT, shims};

/// Native stack reserved on top of the interpreter's own stack limit.
const THREAD_STACK_HEADROOM: usize = 8 * 1024 * 1024;

const OUT_OF_MEMORY: &str = "out of memory";

pub enum Command {
    Call {
        target: u64,
        args: Vec<Wire>,
        reply: Reply,
    },
    Snapshot {
        id: u64,
        reply: Reply,
    },
    Property {
        id: u64,
        key: String,
        reply: Reply,
    },
    Release {
        id: u64,
    },
    HostReply {
        handle: u32,
        result: core::result::Result<Wire, String>,
    },
    Dispose,
}

pub type Ready = oneshot::Receiver<Result<()>>;

/// Start a worker thread for `entry`. The returned receiver resolves once
/// the entry point is compiled.
pub fn spawn(
    options: SandboxOptions,
    entry: Entry,
    guard: Arc<Guard>,
    host: UnboundedSender<HostRequest>,
) -> Result<(Sender<Command>, Ready)> {
    let (commands, inbox) = std::sync::mpsc::channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let stack_size = options.max_stack_size.saturating_add(THREAD_STACK_HEADROOM);

    std::thread::Builder::new()
        .name("noderun-sandbox".to_owned())
        .stack_size(stack_size)
        .spawn(move || {
            state::install(host, guard.clone());
            match Worker::boot(&options, &entry, guard) {
                Ok(worker) => {
                    let _ = ready_tx.send(Ok(()));
                    worker.serve(&inbox);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "sandbox failed to start");
                    let _ = ready_tx.send(Err(err));
                }
            }
        })
        .map_err(|e| ExecutionError::Internal(format!("failed to spawn sandbox worker: {e}")))?;

    Ok((commands, ready_rx))
}

struct Worker {
    guard: Arc<Guard>,
    timeout: Duration,
    on_fatal: Option<FatalHandler>,
    // Field order matters: the context must go before the runtime.
    context: Context,
    runtime: Runtime,
}

impl Worker {
    fn boot(options: &SandboxOptions, entry: &Entry, guard: Arc<Guard>) -> Result<Self> {
        let internal = |e: rquickjs::Error| ExecutionError::Internal(e.to_string());
        let runtime = Runtime::new_with_alloc(Budget::new(options.memory_limit, guard.clone()))
            .map_err(internal)?;
        runtime.set_max_stack_size(options.max_stack_size);
        let interrupt = guard.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.should_interrupt())));
        let context = Context::full(&runtime).map_err(internal)?;

        let worker = Self {
            guard,
            timeout: options.timeout,
            on_fatal: options.on_fatal.clone(),
            context,
            runtime,
        };

        let loaded = worker.guarded(|ctx| {
            let internals = shims::install(ctx, &options.shims, host_object(ctx)?)?;
            state::set_internals(ctx, internals);
            let entry = compile(ctx, entry)?;
            if !entry.is_function() {
                return Err(rquickjs::Error::new_from_js_message(
                    entry.type_name(),
                    "function",
                    "entry point is not a function",
                ));
            }
            state::register_entry(ctx, entry)
        });

        match loaded {
            Ok(()) => Ok(worker),
            Err(ExecutionError::Thrown { name, message, .. }) => Err(ExecutionError::Compile {
                message: format!("{name}: {message}"),
            }),
            Err(ExecutionError::Internal(message)) => Err(ExecutionError::Compile { message }),
            Err(err) => Err(err),
        }
    }

    fn serve(self, inbox: &Receiver<Command>) {
        loop {
            if self.guard.token.is_cancelled() {
                break;
            }
            let command = match state::next_deadline() {
                Some(deadline) => {
                    match inbox.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match inbox.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(Command::Dispose) => break,
                Some(command) => self.handle(command),
                None => {}
            }

            self.expire();
            self.drain_jobs();
            self.expire();
            if state::take_settled() {
                self.collect();
            }

            if self.guard.memory_exhausted() {
                state::mark_fatal(OUT_OF_MEMORY);
            }
            if let Some(message) = state::fatal() {
                self.fail(&message);
                break;
            }
        }
    }

    fn handle(&self, command: Command) {
        match command {
            Command::Call {
                target,
                args,
                reply,
            } => {
                let id = state::add_call(reply, Instant::now() + self.timeout);
                let started = self.context.with(|ctx| {
                    start_call(&ctx, id, target, &args).map_err(|e| self.failure(&ctx, e))
                });
                if let Err(err) = started {
                    if let Some(reply) = state::take_call(id) {
                        state::deliver(reply, Err(err));
                    }
                }
            }
            Command::Snapshot { id, reply } => {
                let result = self.guarded(|ctx| wire::snapshot(ctx, state::restore(ctx, id)?));
                state::deliver(reply, result);
            }
            Command::Property { id, key, reply } => {
                let result = self.guarded(|ctx| {
                    let target = state::restore(ctx, id)?;
                    let value = match target.as_object() {
                        Some(obj) => obj.get::<_, Value<'_>>(key.as_str())?,
                        None => Value::new_undefined(ctx.clone()),
                    };
                    wire::shallow(ctx, value)
                });
                state::deliver(reply, result);
            }
            Command::Release { id } => state::release(id),
            Command::HostReply { handle, result } => {
                let delivered = self.context.with(|ctx| {
                    let (ok, value) = match &result {
                        Ok(wire) => (true, wire::to_js(&ctx, wire)?),
                        Err(message) => (false, rquickjs::String::from_str(ctx.clone(), message)?.into_value()),
                    };
                    let resolve: Function<'_> = state::internals(&ctx)?.get("resolve")?;
                    resolve.call::<_, ()>((handle, ok, value))
                });
                if delivered.is_err() {
                    self.drop_exception();
                }
            }
            Command::Dispose => {}
        }
    }

    /// Run `f` with the interpreter bounded by the per-call timeout.
    fn guarded<T>(&self, f: impl FnOnce(&Ctx<'_>) -> rquickjs::Result<T>) -> Result<T> {
        self.guard
            .set_op_deadline(Some(Instant::now() + self.timeout));
        let result = self.context.with(|ctx| f(&ctx).map_err(|e| self.failure(&ctx, e)));
        self.guard.set_op_deadline(None);
        result
    }

    /// Collect garbage left by finished calls so finalizers, such as the one
    /// releasing unread response bodies, get to run.
    fn collect(&self) {
        self.runtime.run_gc();
        self.drain_jobs();
    }

    fn drain_jobs(&self) {
        self.context.with(|ctx| while ctx.execute_pending_job() {});
        self.drop_exception();
    }

    /// Clear an exception nobody is waiting on.
    fn drop_exception(&self) {
        self.context.with(|ctx| {
            ctx.catch();
        });
    }

    fn expire(&self) {
        for reply in state::take_expired(Instant::now()) {
            tracing::debug!(timeout = ?self.timeout, "sandbox call timed out");
            let _ = reply.send(Err(ExecutionError::Timeout {
                limit: self.timeout,
            }));
        }
    }

    fn failure(&self, ctx: &Ctx<'_>, err: rquickjs::Error) -> ExecutionError {
        let thrown = match err {
            rquickjs::Error::Exception => Some(ctx.catch()),
            rquickjs::Error::Allocation => return fatal(OUT_OF_MEMORY),
            _ => None,
        };
        if self.guard.memory_exhausted() {
            return fatal(OUT_OF_MEMORY);
        }
        if self.guard.token.is_cancelled() {
            return self.guard.closed_error();
        }
        if self.guard.deadline_passed(Instant::now()) {
            return ExecutionError::Timeout {
                limit: self.timeout,
            };
        }
        match thrown {
            Some(value) => rejection(&value),
            None => ExecutionError::Internal(err.to_string()),
        }
    }

    fn fail(&self, message: &str) {
        tracing::warn!(%message, "execution context failed");
        self.guard.set_fatal(message);
        if let Some(on_fatal) = &self.on_fatal {
            on_fatal(message);
        }
        self.guard.token.cancel();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.guard.token.cancel();
        let error = self.guard.closed_error();
        for reply in state::clear() {
            let _ = reply.send(Err(error.clone()));
        }
    }
}

fn compile<'js>(ctx: &Ctx<'js>, entry: &Entry) -> rquickjs::Result<Value<'js>> {
    match entry {
        Entry::Expression(source) => ctx.eval(format!("({source}\n)")),
        Entry::Global { script, name } => {
            ctx.eval::<(), _>(script.as_str())?;
            ctx.globals().get(name.as_str())
        }
    }
}

fn start_call(ctx: &Ctx<'_>, id: u32, target: u64, args: &[Wire]) -> rquickjs::Result<()> {
    let target = state::restore(ctx, target)?;
    let Some(func) = target.as_function() else {
        return Err(rquickjs::Error::new_from_js_message(
            target.type_name(),
            "function",
            "value is not callable",
        ));
    };
    let mut js_args = Args::new(ctx.clone(), args.len());
    for arg in args {
        js_args.push_arg(wire::to_js(ctx, arg)?)?;
    }
    let result: Value<'_> = func.call_arg(js_args)?;
    let track: Function<'_> = state::internals(ctx)?.get("track")?;
    track.call::<_, ()>((id, result))
}

fn fatal(message: &str) -> ExecutionError {
    state::mark_fatal(message);
    ExecutionError::Fatal {
        message: message.to_owned(),
    }
}

/// Map a thrown or rejected value to a host error. Only genuine error
/// objects are reflected; anything else is reported opaquely.
///
/// A script-visible message never decides fatality; see [`Budget`].
fn rejection(value: &Value<'_>) -> ExecutionError {
    let Some(exc) = value.as_exception() else {
        return ExecutionError::NonErrorThrown;
    };
    let message = exc.message().unwrap_or_default();
    let name = exc
        .get::<_, Option<String>>("name")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Error".to_owned());
    ExecutionError::Thrown {
        name,
        message,
        stack: exc.stack(),
    }
}

fn host_object<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;
    host.set(
        "settle",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, call: u32, ok: bool, value: Value<'js>| settle(&ctx, call, ok, &value),
        )?,
    )?;
    host.set(
        "fetch",
        Function::new(ctx.clone(), |request: Object<'js>| fetch(&request))?,
    )?;
    host.set(
        "readBody",
        Function::new(ctx.clone(), |body: u32, mode: String| read_body(body, &mode))?,
    )?;
    host.set(
        "dropBody",
        Function::new(ctx.clone(), |body: u32| {
            state::notify_host(HostRequest::DropBody { body });
        })?,
    )?;
    host.set(
        "log",
        Function::new(ctx.clone(), |level: String, message: String| {
            log(&level, &message);
        })?,
    )?;
    Ok(host)
}

fn settle<'js>(ctx: &Ctx<'js>, call: u32, ok: bool, value: &Value<'js>) -> rquickjs::Result<()> {
    if state::out_of_memory() {
        if let Some(reply) = state::take_call(call) {
            let _ = reply.send(Err(fatal(OUT_OF_MEMORY)));
        }
        return Ok(());
    }
    // A rejection caused by the interrupt handler is answered by the
    // timeout or disposal path instead.
    if !ok && state::interrupted() {
        return Ok(());
    }
    let Some(reply) = state::take_call(call) else {
        return Ok(());
    };
    let result = if ok {
        wire::shallow(ctx, value.clone()).map_err(|e| ExecutionError::Internal(e.to_string()))
    } else {
        Err(rejection(value))
    };
    state::deliver(reply, result);
    Ok(())
}

fn fetch(request: &Object<'_>) -> rquickjs::Result<u32> {
    let method: String = request.get("method")?;
    let url: String = request.get("url")?;
    let headers = request
        .get::<_, Vec<Vec<String>>>("headers")?
        .into_iter()
        .filter_map(|pair| match <[String; 2]>::try_from(pair) {
            Ok([name, value]) => Some((name, value)),
            Err(_) => None,
        })
        .collect();
    let body: Value<'_> = request.get("body")?;
    let body = request_body(body)?;

    state::send_host(|handle| HostRequest::Fetch {
        handle,
        request: FetchRequest {
            method,
            url,
            headers,
            body,
        },
    })
}

fn request_body(body: Value<'_>) -> rquickjs::Result<Option<Bytes>> {
    if body.is_null() || body.is_undefined() {
        return Ok(None);
    }
    if let Some(text) = body.as_string() {
        return Ok(Some(Bytes::from(text.to_string()?)));
    }
    if let Some(buf) = ArrayBuffer::from_value(body.clone()) {
        return Ok(buf.as_bytes().map(Bytes::copy_from_slice));
    }
    if let Ok(typed) = TypedArray::<u8>::from_value(body.clone()) {
        return Ok(typed.as_bytes().map(Bytes::copy_from_slice));
    }
    Err(rquickjs::Error::new_from_js_message(
        body.type_name(),
        "body",
        "unsupported request body",
    ))
}

fn read_body(body: u32, mode: &str) -> rquickjs::Result<u32> {
    let mode = match mode {
        "text" => BodyMode::Text,
        "bytes" => BodyMode::Bytes,
        _ => {
            return Err(rquickjs::Error::new_from_js_message(
                "string",
                "body mode",
                "expected \"text\" or \"bytes\"",
            ));
        }
    };
    state::send_host(|handle| HostRequest::ReadBody { handle, body, mode })
}

fn log(level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: TRACE_TARGET_SCRIPT, "{message}"),
        "warn" => tracing::warn!(target: TRACE_TARGET_SCRIPT, "{message}"),
        "debug" => tracing::debug!(target: TRACE_TARGET_SCRIPT, "{message}"),
        _ => tracing::info!(target: TRACE_TARGET_SCRIPT, "{message}"),
    }
}
