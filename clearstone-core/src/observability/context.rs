//! Context-local active span
//!
//! The active span is tracked per thread and swapped in around each poll of a
//! wrapped future, so concurrent tasks on a shared runtime never observe each
//! other's spans.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::span::SpanContext;

thread_local! {
    static ACTIVE: RefCell<Vec<Option<SpanContext>>> = const { RefCell::new(Vec::new()) };
}

/// The span that new spans on this thread will be parented to
pub fn current() -> Option<SpanContext> {
    ACTIVE.with(|active| active.borrow().last().cloned().flatten())
}

/// Install a context until the returned guard is dropped.
pub(crate) fn enter(context: Option<SpanContext>) -> ContextGuard {
    let depth = ACTIVE.with(|active| {
        let mut stack = active.borrow_mut();
        stack.push(context);
        stack.len()
    });
    ContextGuard {
        depth,
        _not_send: PhantomData,
    }
}

/// Pops its entry, and everything entered after it, on drop. Bound to the
/// thread that created it.
pub(crate) struct ContextGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            let mut stack = active.borrow_mut();
            // Already popped when an enclosing guard was dropped first.
            if stack.len() >= self.depth {
                stack.truncate(self.depth - 1);
            }
        });
    }
}

/// Future adapter that runs every poll of `F` with a fixed active span.
pub struct WithSpanContext<F> {
    inner: Pin<Box<F>>,
    context: Option<SpanContext>,
}

impl<F: Future> Future for WithSpanContext<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = enter(this.context.clone());
        this.inner.as_mut().poll(cx)
    }
}

/// Run `future` with `context` as its active span.
///
/// Use this when spawning tasks that should be parented to the caller's span:
///
/// ```ignore
/// let parent = clearstone_core::observability::current_span();
/// tokio::spawn(with_span_context(parent, async move { /* ... */ }));
/// ```
pub fn with_span_context<F: Future>(context: Option<SpanContext>, future: F) -> WithSpanContext<F> {
    WithSpanContext {
        inner: Box::pin(future),
        context,
    }
}
