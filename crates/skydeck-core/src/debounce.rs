// Trailing-edge debounce primitive.
//
// Modeled as an explicit value-carrying timer rather than closure
// captures: `signal()` records the most recent value and arms (or, on a
// value change, re-arms) the deadline; `fired()` resolves once the
// window elapses and hands back exactly that latest value.
//
// Two usage patterns fall out of the value-equality rule:
// - `Debouncer<()>`: every signal is equal, so a burst arms the deadline
//   once and collapses into a single firing -- the supervisor's
//   push-storm coalescing.
// - `Debouncer<T>` with changing values: the deadline restarts whenever
//   the value changes, so it fires only after the value has been stable
//   for a full window -- the client's fallback-persistence guard.

use std::time::Duration;

use tokio::time::Instant;

pub struct Debouncer<T> {
    window: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T: PartialEq> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record a trigger with its value.
    ///
    /// Arms the deadline if idle; restarts it if the value differs from
    /// the pending one. An equal value inside an armed window is
    /// coalesced into the pending firing.
    pub fn signal(&mut self, value: T) {
        if self.pending.as_ref() != Some(&value) || self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
        self.pending = Some(value);
    }

    /// Disarm without firing, dropping any pending value.
    pub fn reset(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    /// Whether a firing is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the armed window elapses, yielding the latest value.
    ///
    /// Pends forever while disarmed, so it is safe to park in a `select!`
    /// arm. Cancel-safe: dropping the future mid-wait keeps the deadline
    /// and the pending value intact.
    pub async fn fired(&mut self) -> T {
        loop {
            match self.deadline {
                None => std::future::pending::<()>().await,
                Some(deadline) => {
                    tokio::time::sleep_until(deadline).await;
                    self.deadline = None;
                    if let Some(value) = self.pending.take() {
                        return value;
                    }
                    // Deadline without a value only happens after reset
                    // raced a signal; treat as disarmed.
                }
            }
        }
    }
}
