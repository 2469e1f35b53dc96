//! Web-style globals compiled into every execution context.
//!
//! Everything except `fetch` runs purely inside the sandbox; `fetch` talks to
//! the host through the native functions handed to [`install`].

use rquickjs::{Ctx, Function, Object, Value};
use serde::{Deserialize, Serialize};

const PRELUDE: &str = include_str!("js/prelude.js");
const HEADERS: &str = include_str!("js/headers.js");
const ENCODING: &str = include_str!("js/encoding.js");
const CONSOLE: &str = include_str!("js/console.js");
const FETCH: &str = include_str!("js/fetch.js");

/// Which globals to install. `fetch` implies `headers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimSet {
    pub fetch: bool,
    pub headers: bool,
    pub text_encoding: bool,
    pub console: bool,
}

impl Default for ShimSet {
    fn default() -> Self {
        Self::all()
    }
}

impl ShimSet {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            fetch: true,
            headers: true,
            text_encoding: true,
            console: true,
        }
    }

    #[must_use]
    pub const fn none() -> Self {
        Self {
            fetch: false,
            headers: false,
            text_encoding: false,
            console: false,
        }
    }
}

/// Install the selected shims. `host` carries the native `settle`, `fetch`,
/// `readBody`, `dropBody` and `log` functions.
///
/// Returns the internal object the worker uses to track calls (`track`) and
/// to complete host round-trips (`resolve`).
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    set: &ShimSet,
    host: Object<'js>,
) -> rquickjs::Result<Object<'js>> {
    let global = ctx.globals();
    let prelude: Function<'js> = ctx.eval(PRELUDE)?;
    let internals: Object<'js> = prelude.call((host.clone(),))?;

    if set.headers || set.fetch {
        let headers: Function<'js> = ctx.eval(HEADERS)?;
        let class: Value<'js> = headers.call((global.clone(),))?;
        if set.fetch {
            let fetch: Function<'js> = ctx.eval(FETCH)?;
            let wait: Function<'js> = internals.get("wait")?;
            let send: Function<'js> = host.get("fetch")?;
            let read: Function<'js> = host.get("readBody")?;
            let drop_body: Function<'js> = host.get("dropBody")?;
            fetch.call::<_, ()>((global.clone(), class, wait, send, read, drop_body))?;
        }
    }

    if set.text_encoding {
        let encoding: Function<'js> = ctx.eval(ENCODING)?;
        encoding.call::<_, ()>((global.clone(),))?;
    }

    if set.console {
        let console: Function<'js> = ctx.eval(CONSOLE)?;
        let log: Function<'js> = host.get("log")?;
        console.call::<_, ()>((global, log))?;
    }

    Ok(internals)
}
