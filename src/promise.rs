//! Single-resolution promises.
//!
//! A [`Promise`] is a shared, clonable handle to a value that becomes
//! available later. It is the completion type of every remote call and of
//! transceiver readiness.
//!
//! # Guarantees
//!
//! - A promise settles at most once. A second `resolve`/`reject` returns
//!   [`Error::AlreadyResolved`].
//! - Handlers never run inside the call that registered or settled them.
//!   They are dispatched on a later turn of the Tokio scheduler, even when
//!   the promise is already settled.
//! - A handler may return another promise ([`Settle::Adopt`]); the derived
//!   promise then follows that promise's eventual state. Adopting oneself
//!   rejects with `TypeError`.
//! - `then` may be called any number of times; each call derives an
//!   independent promise.
//! - There is no cancellation. A promise dropped while rejected with no
//!   handler attached logs a warning.
//!
//! Promises implement [`IntoFuture`], so they can simply be awaited.
//!
//! # Example
//!
//! ```ignore
//! let promise = Promise::new();
//! let doubled = promise.map(|n: i64| n * 2);
//! promise.resolve(21)?;
//! assert_eq!(doubled.await?, 42);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{Error, Result, TYPE_ERROR, WiseException};

// ============================================================================
// Types
// ============================================================================

/// Outcome a promise settles with.
pub type Outcome<T> = std::result::Result<T, WiseException>;

/// Callback run once the promise settles.
type Reaction<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

// ============================================================================
// Settle
// ============================================================================

/// What a handler produces for the derived promise.
pub enum Settle<T> {
    /// Fulfill with a value.
    Fulfill(T),
    /// Reject with an exception.
    Reject(WiseException),
    /// Follow another promise's eventual state.
    Adopt(Promise<T>),
}

impl<T> Settle<T> {
    /// Rejects with the wire form of `err`.
    #[inline]
    #[must_use]
    pub fn error(err: &Error) -> Self {
        Self::Reject(err.to_exception())
    }
}

impl<T: Clone + Send + 'static> Settle<T> {
    /// Follows a native future.
    #[inline]
    #[must_use]
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::Adopt(Promise::spawn(future))
    }
}

impl<T> From<Result<T>> for Settle<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Fulfill(value),
            Err(err) => Self::error(&err),
        }
    }
}

impl<T> From<Outcome<T>> for Settle<T> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Ok(value) => Self::Fulfill(value),
            Err(exception) => Self::Reject(exception),
        }
    }
}

// ============================================================================
// State
// ============================================================================

enum State<T> {
    Pending(Vec<Reaction<T>>),
    Fulfilled(T),
    Rejected(WiseException),
}

struct Inner<T> {
    state: State<T>,
    /// Resolved with another promise; still pending until it settles.
    adopting: bool,
    /// At least one reaction was attached.
    handled: bool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let State::Rejected(exception) = &self.state
            && !self.handled
        {
            warn!(
                name = %exception.name,
                message = %exception.message,
                "Unhandled promise rejection"
            );
        }
    }
}

// ============================================================================
// Promise
// ============================================================================

/// A single-resolution, clonable promise.
///
/// Clones share state: settling one clone settles all of them.
pub struct Promise<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.lock().state {
            State::Pending(_) => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Promise - Constructors
// ============================================================================

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates a pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending(Vec::new()),
                adopting: false,
                handled: false,
            })),
        }
    }

    /// Creates a promise already fulfilled with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.inner.lock().state = State::Fulfilled(value);
        promise
    }

    /// Creates a promise already rejected with `reason`.
    #[must_use]
    pub fn rejected(reason: impl Into<WiseException>) -> Self {
        let promise = Self::new();
        promise.inner.lock().state = State::Rejected(reason.into());
        promise
    }

    /// Runs `future` on a new task and settles with its output.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let promise = Self::new();
        let target = promise.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result.map_err(|e| e.to_exception()),
                Err(panic) => Err(panic_exception(panic.as_ref())),
            };
            let _ = target.complete(outcome, false);
        });
        promise
    }
}

// ============================================================================
// Promise - Settlement
// ============================================================================

impl<T: Clone + Send + 'static> Promise<T> {
    /// Fulfills the promise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the promise was already
    /// settled or is adopting another promise.
    pub fn resolve(&self, value: T) -> Result<()> {
        self.complete(Ok(value), false)
    }

    /// Rejects the promise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the promise was already
    /// settled or is adopting another promise.
    pub fn reject(&self, reason: impl Into<WiseException>) -> Result<()> {
        self.complete(Err(reason.into()), false)
    }

    /// Resolves this promise with another one (Promise Resolution Procedure).
    ///
    /// The promise stays pending and follows `other`'s eventual state.
    /// Adopting itself rejects with `TypeError`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the promise was already
    /// settled or is adopting another promise.
    pub fn adopt(&self, other: &Promise<T>) -> Result<()> {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return self.reject(WiseException::new(
                TYPE_ERROR,
                "a promise cannot be resolved with itself",
            ));
        }

        {
            let mut inner = self.inner.lock();
            if inner.adopting || !matches!(inner.state, State::Pending(_)) {
                return Err(Error::AlreadyResolved);
            }
            inner.adopting = true;
        }

        let target = self.clone();
        other.subscribe(Box::new(move |outcome| {
            let _ = target.complete(outcome, true);
        }));
        Ok(())
    }

    /// Applies a handler's [`Settle`] result.
    fn settle(&self, settle: Settle<T>) {
        let result = match settle {
            Settle::Fulfill(value) => self.resolve(value),
            Settle::Reject(exception) => self.reject(exception),
            Settle::Adopt(other) => self.adopt(&other),
        };
        if let Err(e) = result {
            warn!(error = %e, "Derived promise settled twice");
        }
    }

    fn complete(&self, outcome: Outcome<T>, from_adoption: bool) -> Result<()> {
        let reactions = {
            let mut inner = self.inner.lock();
            if inner.adopting && !from_adoption {
                return Err(Error::AlreadyResolved);
            }
            let State::Pending(reactions) = &mut inner.state else {
                return Err(Error::AlreadyResolved);
            };
            let reactions = std::mem::take(reactions);
            inner.state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(exception) => State::Rejected(exception.clone()),
            };
            inner.adopting = false;
            reactions
        };

        trace!(reactions = reactions.len(), ok = outcome.is_ok(), "Promise settled");
        dispatch(reactions, outcome);
        Ok(())
    }

    /// Registers a reaction, dispatching it later if already settled.
    fn subscribe(&self, reaction: Reaction<T>) {
        let mut inner = self.inner.lock();
        inner.handled = true;
        let outcome = match &mut inner.state {
            State::Pending(reactions) => {
                reactions.push(reaction);
                return;
            }
            State::Fulfilled(value) => Ok(value.clone()),
            State::Rejected(exception) => Err(exception.clone()),
        };
        drop(inner);
        dispatch(vec![reaction], outcome);
    }
}

// ============================================================================
// Promise - Chaining
// ============================================================================

impl<T: Clone + Send + 'static> Promise<T> {
    /// Derives a promise from this one's fulfillment.
    ///
    /// Rejections pass through to the derived promise unchanged.
    #[must_use]
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Settle<U> + Send + 'static,
    {
        self.then_or(on_fulfilled, Settle::Reject)
    }

    /// Derives a promise from either outcome.
    #[must_use]
    pub fn then_or<U, F, G>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Settle<U> + Send + 'static,
        G: FnOnce(WiseException) -> Settle<U> + Send + 'static,
    {
        let derived = Promise::new();
        let target = derived.clone();
        self.subscribe(Box::new(move |outcome| {
            let settle = catch_unwind(AssertUnwindSafe(|| match outcome {
                Ok(value) => on_fulfilled(value),
                Err(exception) => on_rejected(exception),
            }))
            .unwrap_or_else(|panic| Settle::Reject(panic_exception(panic.as_ref())));
            target.settle(settle);
        }));
        derived
    }

    /// Derives a promise that recovers from rejection.
    #[must_use]
    pub fn catch<G>(&self, on_rejected: G) -> Promise<T>
    where
        G: FnOnce(WiseException) -> Settle<T> + Send + 'static,
    {
        self.then_or(Settle::Fulfill, on_rejected)
    }

    /// Derives a promise holding `f` applied to the value.
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(move |value| Settle::Fulfill(f(value)))
    }
}

// ============================================================================
// Promise - Inspection
// ============================================================================

impl<T> Promise<T> {
    /// Returns `true` while the promise has not settled.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.inner.lock().state, State::Pending(_))
    }

    /// Returns `true` if the promise was fulfilled.
    #[inline]
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.lock().state, State::Fulfilled(_))
    }

    /// Returns `true` if the promise was rejected.
    #[inline]
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.lock().state, State::Rejected(_))
    }

    /// Returns `true` if both handles share the same state.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// Promise - Await
// ============================================================================

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.subscribe(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }));

        Box::pin(async move {
            match rx.await? {
                Ok(value) => Ok(value),
                Err(exception) => Err(Error::from(exception)),
            }
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Runs reactions on a later scheduler turn, in registration order.
fn dispatch<T: Clone + Send + 'static>(reactions: Vec<Reaction<T>>, outcome: Outcome<T>) {
    if reactions.is_empty() {
        return;
    }

    tokio::spawn(async move {
        for reaction in reactions {
            reaction(outcome.clone());
        }
    });
}

/// Converts a panic payload into an `UnknownLocalException`.
pub(crate) fn panic_exception(payload: &(dyn std::any::Any + Send)) -> WiseException {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string());

    Error::unknown_local(message).to_exception()
}

// ============================================================================
// Tests
// ============================================================================
