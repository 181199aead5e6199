//! Name→handler routing.
//!
//! Procedures register under string names; the wire identifies them by
//! [`name_hash`]. Each registration stores an adapter closure that decodes
//! the argument tuple, invokes the handler, and encodes the status-tagged
//! reply. Routing itself is stateless and safe to invoke concurrently from
//! any worker thread; handlers therefore must be `Send + Sync`.

use std::any::TypeId;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use log::trace;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::hash::name_hash;

type BoxedHandler = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Registry of procedures, keyed by the 32-bit name hash.
///
/// Registration is last-wins per name. The original name is kept alongside
/// the hash for diagnostics.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<u32, BoxedHandler>,
    names: HashMap<u32, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure. The argument tuple type is derived from the
    /// handler's signature; a unit return uses the bodyless success envelope.
    pub fn register<Args, R, F>(&mut self, name: &str, f: F)
    where
        Args: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(Args) -> R + Send + Sync + 'static,
    {
        let adapter = move |payload: &[u8]| -> Vec<u8> {
            let args: Args = match codec::decode_args(payload) {
                Ok(args) => args,
                Err(e) => return codec::encode_fail(&e.to_string()),
            };
            match catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(value) => encode_reply(&value),
                Err(panic) => codec::encode_fail(&panic_message(panic)),
            }
        };
        self.insert(name, Box::new(adapter));
    }

    /// Register a procedure that can fail. `Err(message)` becomes a failure
    /// reply without tearing down the connection.
    pub fn register_fallible<Args, R, F>(&mut self, name: &str, f: F)
    where
        Args: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(Args) -> std::result::Result<R, String> + Send + Sync + 'static,
    {
        let adapter = move |payload: &[u8]| -> Vec<u8> {
            let args: Args = match codec::decode_args(payload) {
                Ok(args) => args,
                Err(e) => return codec::encode_fail(&e.to_string()),
            };
            match catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(Ok(value)) => encode_reply(&value),
                Ok(Err(message)) => codec::encode_fail(&message),
                Err(panic) => codec::encode_fail(&panic_message(panic)),
            }
        };
        self.insert(name, Box::new(adapter));
    }

    /// Register a method bound to a shared receiver.
    pub fn register_method<S, Args, R, F>(&mut self, name: &str, receiver: Arc<S>, method: F)
    where
        S: Send + Sync + 'static,
        Args: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&S, Args) -> R + Send + Sync + 'static,
    {
        self.register(name, move |args: Args| method(&receiver, args));
    }

    /// Dispatch one decoded frame: look up the handler and produce the reply
    /// payload. Every abnormal outcome is encoded as a failure reply.
    pub fn route(&self, function_id: u32, payload: &[u8]) -> Vec<u8> {
        let Some(handler) = self.handlers.get(&function_id) else {
            trace!("route: no handler for {function_id:#010x}");
            return codec::encode_fail("unknown function");
        };
        let reply = handler(payload);
        if reply.len() > u32::MAX as usize {
            return codec::encode_fail("result too long");
        }
        reply
    }

    /// The name a hash was registered under, for diagnostics.
    pub fn name_of(&self, function_id: u32) -> Option<&str> {
        self.names.get(&function_id).map(String::as_str)
    }

    fn insert(&mut self, name: &str, handler: BoxedHandler) {
        let key = name_hash(name);
        self.names.insert(key, name.to_string());
        self.handlers.insert(key, handler);
    }
}

/// Encode a handler's return value. Unit returns pick the bodyless envelope;
/// the branch is resolved per monomorphization.
fn encode_reply<R: Serialize + 'static>(value: &R) -> Vec<u8> {
    if TypeId::of::<R>() == TypeId::of::<()>() {
        return codec::encode_ok_void();
    }
    match codec::encode_ok(value) {
        Ok(bytes) => bytes,
        Err(e) => codec::encode_fail(&e.to_string()),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{STATUS_FAIL, STATUS_OK};
    use rmpv::Value;

    fn envelope(bytes: &[u8]) -> Vec<Value> {
        let value: Value = rmp_serde::from_slice(bytes).unwrap();
        value.as_array().unwrap().to_vec()
    }

    #[test]
    fn routes_to_registered_handler() {
        let mut router = Router::new();
        router.register("add", |(a, b): (i32, i32)| a + b);

        let args = codec::encode_args(&(2i32, 3i32)).unwrap();
        let reply = router.route(name_hash("add"), &args);

        let items = envelope(&reply);
        assert_eq!(items[0].as_i64(), Some(STATUS_OK as i64));
        assert_eq!(items[1].as_i64(), Some(5));
    }

    #[test]
    fn unknown_function_fails() {
        let router = Router::new();
        let reply = router.route(name_hash("nope"), &[]);

        let items = envelope(&reply);
        assert_eq!(items[0].as_i64(), Some(STATUS_FAIL as i64));
        assert_eq!(items[1].as_str(), Some("unknown function"));
    }

    #[test]
    fn argument_mismatch_fails_in_band() {
        let mut router = Router::new();
        router.register("add", |(a, b): (i32, i32)| a + b);

        let args = codec::encode_args(&("one", 2i32)).unwrap();
        let reply = router.route(name_hash("add"), &args);

        let items = envelope(&reply);
        assert_eq!(items[0].as_i64(), Some(STATUS_FAIL as i64));
        assert!(items[1].as_str().is_some());
    }

    #[test]
    fn void_handler_uses_bodyless_envelope() {
        let mut router = Router::new();
        router.register("noop", |_: ()| ());

        let args = codec::encode_args(&()).unwrap();
        let reply = router.route(name_hash("noop"), &args);

        let items = envelope(&reply);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_i64(), Some(STATUS_OK as i64));
    }

    #[test]
    fn fallible_handler_error_becomes_fail_reply() {
        let mut router = Router::new();
        router.register_fallible("half", |(n,): (i32,)| {
            if n % 2 == 0 {
                Ok(n / 2)
            } else {
                Err(format!("{n} is odd"))
            }
        });

        let ok = router.route(name_hash("half"), &codec::encode_args(&(4i32,)).unwrap());
        assert_eq!(envelope(&ok)[1].as_i64(), Some(2));

        let err = router.route(name_hash("half"), &codec::encode_args(&(3i32,)).unwrap());
        let items = envelope(&err);
        assert_eq!(items[0].as_i64(), Some(STATUS_FAIL as i64));
        assert_eq!(items[1].as_str(), Some("3 is odd"));
    }

    #[test]
    fn handler_panic_is_contained() {
        let mut router = Router::new();
        router.register("boom", |_: ()| -> i32 { panic!("kaboom") });

        let reply = router.route(name_hash("boom"), &codec::encode_args(&()).unwrap());
        let items = envelope(&reply);
        assert_eq!(items[0].as_i64(), Some(STATUS_FAIL as i64));
        assert_eq!(items[1].as_str(), Some("kaboom"));
    }

    #[test]
    fn method_handler_sees_receiver_state() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter {
            calls: AtomicUsize,
        }

        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });

        let mut router = Router::new();
        router.register_method("bump", Arc::clone(&counter), |c: &Counter, _: ()| {
            c.calls.fetch_add(1, Ordering::SeqCst);
        });

        let args = codec::encode_args(&()).unwrap();
        router.route(name_hash("bump"), &args);
        router.route(name_hash("bump"), &args);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn last_registration_wins() {
        let mut router = Router::new();
        router.register("f", |_: ()| 1i32);
        router.register("f", |_: ()| 2i32);

        let reply = router.route(name_hash("f"), &codec::encode_args(&()).unwrap());
        assert_eq!(envelope(&reply)[1].as_i64(), Some(2));
    }

    #[test]
    fn records_names_for_diagnostics() {
        let mut router = Router::new();
        router.register("hello", |(a, b): (i32, i32)| a + b);
        assert_eq!(router.name_of(name_hash("hello")), Some("hello"));
        assert_eq!(router.name_of(name_hash("missing")), None);
    }
}
