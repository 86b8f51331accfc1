//! Fair counting limiter bounding the number of simultaneously open files.
//!
//! Waiters are served strictly in arrival order: a large request at the head
//! of the queue is not starved by a stream of smaller ones behind it. The wait
//! in [`AdmissionGate::acquire`] is not cancellable; callers that need to
//! abandon a reservation must do so above this layer.

use std::sync::{Condvar, Mutex};

#[derive(Debug)]
struct State {
    /// Currently available permits.
    avail: usize,
    /// Ticket handed to the next caller of `acquire`.
    next_ticket: u64,
    /// Ticket allowed to take permits next.
    serving: u64,
}

#[derive(Debug)]
pub struct AdmissionGate {
    total: usize,
    state: Mutex<State>,
    cv: Condvar,
}

impl AdmissionGate {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            state: Mutex::new(State {
                avail: total,
                next_ticket: 0,
                serving: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Snapshot of the permits not currently granted.
    pub fn available(&self) -> usize {
        self.state.lock().unwrap().avail
    }

    pub fn in_use(&self) -> usize {
        self.total.saturating_sub(self.available())
    }

    /// Blocks until `n` permits can be granted, in arrival order.
    ///
    /// `n` must not exceed the gate's total or the caller waits forever; the
    /// file manager rejects such requests before reaching the gate.
    pub fn acquire(&self, n: usize) {
        debug_assert!(n <= self.total, "acquire({}) exceeds total {}", n, self.total);
        if n == 0 {
            return;
        }

        let mut st = self.state.lock().unwrap();
        let ticket = st.next_ticket;
        st.next_ticket += 1;

        while st.serving != ticket || st.avail < n {
            st = self.cv.wait(st).unwrap();
        }

        st.avail -= n;
        st.serving += 1;
        drop(st);

        // The next ticket holder may already have enough permits.
        self.cv.notify_all();
    }

    /// Takes `n` permits only if they are available now and nobody is queued.
    pub fn try_acquire(&self, n: usize) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.serving != st.next_ticket || st.avail < n {
            return false;
        }
        st.avail -= n;
        true
    }

    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.avail += n;
        debug_assert!(
            st.avail <= self.total,
            "released more permits than were acquired ({} > {})",
            st.avail,
            self.total
        );
        drop(st);
        self.cv.notify_all();
    }
}
