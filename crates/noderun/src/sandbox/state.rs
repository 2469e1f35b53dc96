//! Per-worker registry of sandbox values held on behalf of the host.
//!
//! Lives in a thread local because host functions registered with QuickJS
//! are plain `fn`s that need to reach it without capturing.

use std::{cell::RefCell, collections::HashMap, sync::Arc, time::Instant};

use rquickjs::{Ctx, Object, Persistent, Value};
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use super::{bridge::HostRequest, error::Result, handle::Guard, wire::Wire};

pub type Reply = oneshot::Sender<Result<Wire>>;

pub const ENTRY_REF: u64 = 0;

struct PendingCall {
    reply: Reply,
    deadline: Instant,
}

struct WorkerState {
    refs: HashMap<u64, Persistent<Value<'static>>>,
    next_ref: u64,
    calls: HashMap<u32, PendingCall>,
    next_call: u32,
    next_handle: u32,
    internals: Option<Persistent<Object<'static>>>,
    host: UnboundedSender<HostRequest>,
    guard: Arc<Guard>,
    fatal: Option<String>,
    settled: bool,
}

thread_local! {
    static STATE: RefCell<Option<WorkerState>> = const { RefCell::new(None) };
}

fn with<R>(f: impl FnOnce(&mut WorkerState) -> R) -> Option<R> {
    STATE.with(|s| s.borrow_mut().as_mut().map(f))
}

fn missing_state() -> rquickjs::Error {
    rquickjs::Error::new_from_js_message("worker", "state", "sandbox worker is shutting down")
}

pub fn install(host: UnboundedSender<HostRequest>, guard: Arc<Guard>) {
    STATE.with(|s| {
        *s.borrow_mut() = Some(WorkerState {
            refs: HashMap::new(),
            next_ref: ENTRY_REF + 1,
            calls: HashMap::new(),
            next_call: 0,
            next_handle: 0,
            internals: None,
            host,
            guard,
            fatal: None,
            settled: false,
        });
    });
}

/// Drop every held value and return the replies of calls still pending.
///
/// Must run before the owning `Runtime` is dropped.
pub fn clear() -> Vec<Reply> {
    let state = STATE.with(|s| s.borrow_mut().take());
    state
        .map(|state| state.calls.into_values().map(|c| c.reply).collect())
        .unwrap_or_default()
}

pub fn register<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<u64> {
    let saved = Persistent::save(ctx, value);
    with(|s| {
        let id = s.next_ref;
        s.next_ref += 1;
        s.refs.insert(id, saved);
        id
    })
    .ok_or_else(missing_state)
}

pub fn register_entry<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<()> {
    let saved = Persistent::save(ctx, value);
    with(|s| {
        s.refs.insert(ENTRY_REF, saved);
    })
    .ok_or_else(missing_state)
}

pub fn restore<'js>(ctx: &Ctx<'js>, id: u64) -> rquickjs::Result<Value<'js>> {
    let saved = with(|s| s.refs.get(&id).cloned())
        .flatten()
        .ok_or_else(|| {
            rquickjs::Error::new_from_js_message(
                "reference",
                "value",
                &format!("reference #{id} is no longer available"),
            )
        })?;
    saved.restore(ctx)
}

/// Answer a host request. If the host stopped waiting, whatever the answer
/// registered is released again.
pub fn deliver(reply: Reply, result: Result<Wire>) {
    if let Err(Ok(orphaned)) = reply.send(result) {
        for id in orphaned.held_refs() {
            if id != ENTRY_REF {
                release(id);
            }
        }
    }
}

pub fn release(id: u64) {
    // Dropped outside the borrow; freeing may run finalizers.
    let released = with(|s| s.refs.remove(&id)).flatten();
    drop(released);
}

pub fn set_internals<'js>(ctx: &Ctx<'js>, internals: Object<'js>) {
    let saved = Persistent::save(ctx, internals);
    with(|s| s.internals = Some(saved));
}

pub fn internals<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    with(|s| s.internals.clone())
        .flatten()
        .ok_or_else(missing_state)?
        .restore(ctx)
}

pub fn add_call(reply: Reply, deadline: Instant) -> u32 {
    with(|s| {
        let id = s.next_call;
        s.next_call = s.next_call.wrapping_add(1);
        s.calls.insert(id, PendingCall { reply, deadline });
        sync_deadline(s);
        id
    })
    .unwrap_or_default()
}

pub fn take_call(id: u32) -> Option<Reply> {
    with(|s| {
        let call = s.calls.remove(&id);
        s.settled |= call.is_some();
        sync_deadline(s);
        call.map(|c| c.reply)
    })
    .flatten()
}

/// Whether any call finished since the last check.
pub fn take_settled() -> bool {
    with(|s| std::mem::take(&mut s.settled)).unwrap_or(false)
}

pub fn take_expired(now: Instant) -> Vec<Reply> {
    with(|s| {
        let expired: Vec<u32> = s
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let replies = expired
            .into_iter()
            .filter_map(|id| s.calls.remove(&id))
            .map(|c| c.reply)
            .collect::<Vec<_>>();
        s.settled |= !replies.is_empty();
        sync_deadline(s);
        replies
    })
    .unwrap_or_default()
}

pub fn next_deadline() -> Option<Instant> {
    with(|s| s.calls.values().map(|c| c.deadline).min()).flatten()
}

fn sync_deadline(state: &WorkerState) {
    state
        .guard
        .set_call_deadline(state.calls.values().map(|c| c.deadline).min());
}

/// Hand the host side a request that expects no reply.
pub fn notify_host(request: HostRequest) {
    with(|s| {
        let _ = s.host.send(request);
    });
}

/// Allocate a bridge handle and hand the request to the host side.
pub fn send_host(make: impl FnOnce(u32) -> HostRequest) -> rquickjs::Result<u32> {
    with(|s| {
        let handle = s.next_handle;
        s.next_handle = s.next_handle.wrapping_add(1);
        s.host.send(make(handle)).map(|()| handle).map_err(|_| {
            rquickjs::Error::new_from_js_message("host", "bridge", "host bridge is closed")
        })
    })
    .ok_or_else(missing_state)?
}

/// Whether the interrupt handler is currently aborting script code.
pub fn interrupted() -> bool {
    with(|s| s.guard.should_interrupt()).unwrap_or(true)
}

/// Whether the heap budget has refused an allocation.
pub fn out_of_memory() -> bool {
    with(|s| s.guard.memory_exhausted()).unwrap_or(false)
}

pub fn mark_fatal(message: &str) {
    with(|s| {
        if s.fatal.is_none() {
            s.fatal = Some(message.to_owned());
        }
    });
}

pub fn fatal() -> Option<String> {
    with(|s| s.fatal.clone()).flatten()
}
