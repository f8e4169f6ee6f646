//! Single assignment result cell shared between the task that completes an
//! operation and any number of tasks waiting for it.
//!
//! A promise starts pending and is completed at most once. Completing an
//! already completed promise is a no-op which reports `false`: a per call
//! timeout racing a late reply from the network is normal, and the first
//! outcome wins.
//!
//! A waiter that gives up through [`Promise::get_timeout`] only stops its own
//! wait. The promise stays pending for everybody else.

use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::error::{Error, Result};

#[derive(Clone)]
enum State<T> {
    Pending,
    Succeeded(T),
    Failed(Error),
}

pub struct Promise<T> {
    state: Arc<watch::Sender<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(State::Pending);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn succeeded(value: T) -> Self {
        let promise = Self::new();
        promise.set_success(value);
        promise
    }

    pub fn failed(error: Error) -> Self {
        let promise = Self::new();
        promise.set_failure(error);
        promise
    }

    /// Completes the promise with a value. Returns false if it was already
    /// complete, in which case nothing changes.
    pub fn set_success(&self, value: T) -> bool {
        self.complete(State::Succeeded(value))
    }

    /// Completes the promise with an error. Returns false if it was already
    /// complete, in which case nothing changes.
    pub fn set_failure(&self, error: Error) -> bool {
        self.complete(State::Failed(error))
    }

    fn complete(&self, outcome: State<T>) -> bool {
        self.state.send_if_modified(move |state| {
            if matches!(state, State::Pending) {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Waits until the promise is complete.
    pub async fn get(&self) -> Result<T> {
        let mut rx = self.state.subscribe();
        let outcome = rx
            .wait_for(|state| !matches!(state, State::Pending))
            .await
            .map(|state| (*state).clone())
            // the sender lives as long as `self`
            .map_err(|_| Error::ConnectionClosed)?;
        match outcome {
            State::Succeeded(value) => Ok(value),
            State::Failed(error) => Err(error),
            State::Pending => unreachable!("wait_for only returns once done"),
        }
    }

    /// Waits at most `timeout` for the promise. Expiry fails this call with
    /// [`Error::Timeout`] but leaves the promise itself pending.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// The value if the promise succeeded, without waiting.
    pub fn get_now(&self) -> Option<T> {
        match &*self.state.borrow() {
            State::Succeeded(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The error if the promise failed, without waiting.
    pub fn cause(&self) -> Option<Error> {
        match &*self.state.borrow() {
            State::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.state.borrow(), State::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(*self.state.borrow(), State::Succeeded(_))
    }

    /// Whether a clone of this promise is still held anywhere else.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.state) > 1
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.borrow() {
            State::Pending => "pending",
            State::Succeeded(_) => "succeeded",
            State::Failed(_) => "failed",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
