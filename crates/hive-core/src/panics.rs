//! Containment marker for panics that an enclosing `catch_unwind` handles.
//!
//! The panic hook is global and runs before unwinding starts, so it cannot
//! tell a deliberately-caught panic from an unhandled one on its own. Code
//! that catches panics wraps the guarded future in [`contained`]; a
//! process-fatal hook checks [`is_contained`] and leaves such panics to the
//! catch site.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

thread_local! {
    static CONTAINED: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is polling a [`contained`] future.
pub fn is_contained() -> bool {
    CONTAINED.with(|cell| cell.get())
}

struct Guard {
    prev: bool,
}

impl Guard {
    fn enter() -> Self {
        Self {
            prev: CONTAINED.with(|cell| cell.replace(true)),
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let prev = self.prev;
        CONTAINED.with(|cell| cell.set(prev));
    }
}

/// Mark a future whose panics are handled above it. The marker covers each
/// poll, so a panic raised anywhere inside reaches the hook with the flag
/// set. The caller must still catch the unwind itself.
pub fn contained<F: Future>(future: F) -> Contained<F> {
    Contained {
        inner: Box::pin(future),
    }
}

pub struct Contained<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Contained<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = Guard::enter();
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn hook_sees_the_flag_during_a_contained_panic() {
        static SEEN_CONTAINED: AtomicBool = AtomicBool::new(false);

        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {
            SEEN_CONTAINED.store(is_contained(), Ordering::SeqCst);
        }));

        let result = AssertUnwindSafe(contained(async { panic!("boom") }))
            .catch_unwind()
            .await;

        std::panic::set_hook(prev);

        assert!(result.is_err());
        assert!(SEEN_CONTAINED.load(Ordering::SeqCst));
        // the guard resets on unwind
        assert!(!is_contained());
    }

    #[tokio::test]
    async fn flag_is_off_outside_a_contained_scope() {
        assert!(!is_contained());
        let value = contained(async { 7 }).await;
        assert_eq!(value, 7);
        assert!(!is_contained());
    }
}
