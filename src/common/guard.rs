//! Isolation boundary for user-supplied callbacks.
//!
//! Listener code must never unwind into the gateway or audio loops. Every
//! callback goes through [`guarded`], which logs ordinary panics and swallows
//! them. A panic whose payload is a [`FatalCallbackError`] is re-raised so a
//! listener can still bring the process down deliberately.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use tracing::error;

/// Panic payload that [`guarded`] refuses to swallow.
///
/// Raise it with `std::panic::panic_any(FatalCallbackError(..))`.
#[derive(Debug)]
pub struct FatalCallbackError(pub String);

/// Runs `f`, returning `None` if it panicked with a recoverable payload.
pub fn guarded<R>(label: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            if payload.is::<FatalCallbackError>() {
                panic::resume_unwind(payload);
            }
            error!(
                "Callback '{}' panicked: {}",
                label,
                panic_message(payload.as_ref())
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
