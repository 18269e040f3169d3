//! A manual-reset event, used to park worker threads and their owner.

use crate::Error;
use crate::platform::*;

// -----------------------------------------------------------------------------
// Event

/// An [`Event`] is a flag that threads can block on. It begins *cleared*, can
/// be *set* by any thread, and then stays set until some thread explicitly
/// clears it again.
///
/// This is a manual-reset event: setting it releases every current and future
/// waiter until it is cleared. An auto-reset event (where the first waiter to
/// wake consumes the signal) is not equivalent, because a second waiter could
/// miss the signal.
pub struct Event {
    /// True while the event is set.
    signaled: Mutex<bool>,
    /// Notified whenever the event becomes set.
    changed: Condvar,
}

impl Event {
    /// Creates a new, cleared event.
    pub fn new() -> Event {
        Event {
            signaled: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    /// Sets the event, releasing every thread blocked in [`Event::wait`].
    pub fn set(&self) -> Result<(), Error> {
        let mut signaled = self.signaled.lock().map_err(|_| Error::WaitFailed)?;
        *signaled = true;
        self.changed.notify_all();
        Ok(())
    }

    /// Clears the event. Subsequent calls to [`Event::wait`] block until it is
    /// set again.
    pub fn clear(&self) -> Result<(), Error> {
        *self.signaled.lock().map_err(|_| Error::WaitFailed)? = false;
        Ok(())
    }

    /// Returns true if the event is currently set.
    pub fn is_set(&self) -> Result<bool, Error> {
        Ok(*self.signaled.lock().map_err(|_| Error::WaitFailed)?)
    }

    /// Blocks until the event is set. Returns immediately if it already is.
    /// The event is left set.
    pub fn wait(&self) -> Result<(), Error> {
        let mut signaled = self.signaled.lock().map_err(|_| Error::WaitFailed)?;
        // Loop to mitigate spurious wake-ups.
        while !*signaled {
            signaled = self.changed.wait(signaled).map_err(|_| Error::WaitFailed)?;
        }
        Ok(())
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Tests
