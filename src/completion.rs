//! Write-once completion cell.
//!
//! A [`Completion`] carries the outcome of one in-flight round trip from the
//! caller that drove it to every caller that attached to it. The state cell
//! is a single atomic with one legal transition (empty -> complete), decided
//! by one compare-and-swap; a waiter that observes the transition reads the
//! value with only the atomic on its fast path. Wakers registered before the
//! transition are parked and all woken exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

const EMPTY: u8 = 0;
const COMPLETE: u8 = 1;

pub(crate) struct Completion<T> {
    state: AtomicU8,
    value: OnceLock<T>,
    wakers: Mutex<Vec<Waker>>,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: OnceLock::new(),
            wakers: Mutex::new(Vec::new()),
        }
    }

    /// Publish the outcome and wake every parked waiter. A second completion
    /// is a no-op.
    pub fn complete(&self, value: T) {
        if self.value.set(value).is_err() {
            return;
        }

        // The value is visible before the state flips; waiters that see
        // COMPLETE never observe an unset value.
        if self
            .state
            .compare_exchange(EMPTY, COMPLETE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let wakers = std::mem::take(&mut *self.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }

    /// Await the outcome. Any number of callers may wait concurrently; each
    /// receives its own clone of the value.
    pub fn wait(&self) -> Wait<'_, T> {
        Wait { completion: self }
    }

    fn try_get(&self) -> Option<T> {
        if self.state.load(Ordering::Acquire) == COMPLETE {
            self.value.get().cloned()
        } else {
            None
        }
    }
}

pub(crate) struct Wait<'a, T> {
    completion: &'a Completion<T>,
}

impl<T: Clone> Future for Wait<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.completion.try_get() {
            return Poll::Ready(value);
        }

        let mut wakers = self.completion.wakers.lock();

        // Re-check under the lock: complete() flips the state before it
        // drains, so a transition that raced the first check is caught here.
        if let Some(value) = self.completion.try_get() {
            return Poll::Ready(value);
        }

        wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn complete_before_wait() {
        let cell = Completion::new();
        cell.complete(7u32);
        assert_eq!(cell.wait().await, 7);
    }

    #[tokio::test]
    async fn wait_before_complete() {
        let cell = Arc::new(Completion::new());

        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.complete("done".to_string());

        assert_eq!(waiter.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn many_waiters_each_get_a_clone() {
        let cell = Arc::new(Completion::new());

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.complete(42u64);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn second_completion_is_ignored() {
        let cell = Completion::new();
        cell.complete(1u8);
        cell.complete(2u8);
        assert_eq!(cell.wait().await, 1);
    }
}
