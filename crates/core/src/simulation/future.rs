//! Single-assignment futures bridging suspended scripts to the scheduler.
//!
//! A [`Promise`] and its [`SimFuture`] share one result slot. The slot is
//! resolved at most once: by the producer, by its deadline event, or by the
//! owning process being cancelled. Whichever happens first in scheduler
//! order wins; the others become no-ops.

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use crate::transport::SimError;

enum SlotState<T> {
    Pending(Option<Waker>),
    Ready(Result<T, SimError>),
    Taken,
}

pub(crate) struct Slot<T> {
    state: SlotState<T>,
    /// Outcome used when the deadline fires first.
    on_deadline: fn() -> Result<T, SimError>,
}

impl<T> Slot<T> {
    /// Stores the result and returns the waker to notify, or gives the
    /// result back if the slot was already resolved.
    fn settle(&mut self, result: Result<T, SimError>) -> Result<Option<Waker>, Result<T, SimError>> {
        match &mut self.state {
            SlotState::Pending(waker) => {
                let waker = waker.take();
                self.state = SlotState::Ready(result);
                Ok(waker)
            }
            _ => Err(result),
        }
    }
}

/// Type-erased view of a slot used by the scheduler and the process table.
pub(crate) trait Resolvable {
    /// The deadline elapsed.
    fn expire(&self);
    /// The owning process was cancelled.
    fn cancel(&self);
    fn is_pending(&self) -> bool;
}

impl<T> Resolvable for RefCell<Slot<T>> {
    fn expire(&self) {
        let waker = {
            let mut slot = self.borrow_mut();
            let outcome = (slot.on_deadline)();
            slot.settle(outcome).ok().flatten()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn cancel(&self) {
        let waker = self
            .borrow_mut()
            .settle(Err(SimError::Cancelled))
            .ok()
            .flatten();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.borrow().state, SlotState::Pending(_))
    }
}

fn timeout<T>() -> Result<T, SimError> {
    Err(SimError::Timeout)
}

/// Creates a connected promise/future pair whose deadline (if any) fails
/// with [`SimError::Timeout`].
pub(crate) fn pair<T: 'static>() -> (Promise<T>, SimFuture<T>) {
    pair_with_deadline_outcome(timeout::<T>)
}

/// Creates a pair whose deadline produces `on_deadline()` instead of a
/// timeout. Sleeps use this to complete successfully.
pub(crate) fn pair_with_deadline_outcome<T: 'static>(
    on_deadline: fn() -> Result<T, SimError>,
) -> (Promise<T>, SimFuture<T>) {
    let slot = Rc::new(RefCell::new(Slot {
        state: SlotState::Pending(None),
        on_deadline,
    }));
    (
        Promise { slot: slot.clone() },
        SimFuture { slot },
    )
}

/// Producer side of a suspended operation.
pub(crate) struct Promise<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T: 'static> Promise<T> {
    pub(crate) fn resolvable(&self) -> Rc<dyn Resolvable> {
        self.slot.clone()
    }

    /// True until the slot has been resolved by anyone.
    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.slot.is_pending()
    }

    /// Pending and somebody still holds the future.
    pub(crate) fn is_awaited(&self) -> bool {
        Rc::strong_count(&self.slot) > 1 && self.slot.is_pending()
    }

    /// Completes the future with `value`.
    ///
    /// Gives the value back when the slot is already resolved or nobody is
    /// waiting on it any more, so the caller can keep it.
    pub(crate) fn resolve(self, value: T) -> Result<(), T> {
        // the future holds the only other strong reference
        if Rc::strong_count(&self.slot) < 2 {
            return Err(value);
        }
        let waker = {
            let mut slot = self.slot.borrow_mut();
            let SlotState::Pending(waker) = &mut slot.state else {
                return Err(value);
            };
            let waker = waker.take();
            slot.state = SlotState::Ready(Ok(value));
            waker
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Fails the future with `error`. No-op if already resolved.
    pub(crate) fn fail(self, error: SimError) {
        let waker = self.slot.borrow_mut().settle(Err(error)).ok().flatten();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = matches!(self.slot.borrow().state, SlotState::Pending(_));
        f.debug_struct("Promise").field("pending", &pending).finish()
    }
}

/// Consumer side of a suspended operation.
#[must_use = "futures do nothing unless awaited"]
pub struct SimFuture<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> SimFuture<T> {
    /// Takes a result that was set but never polled.
    pub(crate) fn take_ready(&mut self) -> Option<Result<T, SimError>> {
        let mut slot = self.slot.borrow_mut();
        match std::mem::replace(&mut slot.state, SlotState::Taken) {
            SlotState::Ready(result) => Some(result),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// A future that is already failed.
    pub(crate) fn failed(error: SimError) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot {
                state: SlotState::Ready(Err(error)),
                on_deadline: || Err(SimError::Timeout),
            })),
        }
    }
}

impl<T> Future for SimFuture<T> {
    type Output = Result<T, SimError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match std::mem::replace(&mut slot.state, SlotState::Taken) {
            SlotState::Ready(result) => Poll::Ready(result),
            SlotState::Pending(_) => {
                slot.state = SlotState::Pending(Some(cx.waker().clone()));
                Poll::Pending
            }
            SlotState::Taken => {
                debug_assert!(false, "SimFuture polled after completion");
                Poll::Ready(Err(SimError::Closed))
            }
        }
    }
}

impl<T> fmt::Debug for SimFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimFuture").finish_non_exhaustive()
    }
}
