//! # Piece Picker
//!
//! The work queue shared by all workers of one exchange.
//!
//! Every piece is in exactly one of three states:
//!
//! - **pending**: waiting in the queue, in index order (requeued pieces go last)
//! - **in flight**: taken by one worker, until it completes or releases it
//! - **done**: completed, no longer tracked
//!
//! A worker only takes pieces its peer can serve. When none is pending but
//! one the peer could serve is in flight elsewhere, the worker waits for it to
//! be released instead of leaving. A worker is done with the exchange once no
//! pending or in-flight piece is one it can serve.

use crate::piece::PieceWork;

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of [`PiecePicker::pick`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pick {
    /// A piece to download, now owned by the caller.
    Piece(PieceWork),
    /// Nothing to take yet, but a piece the caller can serve is in flight.
    Idle,
    /// No pending or in-flight piece can be served by the caller.
    Exhausted,
    /// The exchange finished or was cancelled.
    Closed,
}

#[derive(Debug, Default)]
struct PickerState {
    pending: VecDeque<PieceWork>,
    in_flight: HashSet<u32>,
    closed: bool,
}

/// Mutex-guarded piece queue with a change notification.
#[derive(Debug, Default)]
pub struct PiecePicker {
    state: Mutex<PickerState>,
    changed: Condvar,
}

impl PiecePicker {
    /// Creates a picker with every piece pending, in iteration order.
    pub fn new<I: IntoIterator<Item = PieceWork>>(work: I) -> PiecePicker {
        PiecePicker {
            state: Mutex::new(PickerState {
                pending: work.into_iter().collect(),
                ..Default::default()
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PickerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the first pending piece for which `can_serve` holds.
    ///
    /// If there is none but such a piece is in flight, waits up to `wait` for
    /// the queue to change before answering [`Pick::Idle`].
    pub fn pick<F>(&self, can_serve: F, wait: Duration) -> Pick
    where
        F: Fn(u32) -> bool,
    {
        let mut state = self.lock();
        let mut waited = false;

        loop {
            if state.closed {
                return Pick::Closed;
            }

            if let Some(pos) = state.pending.iter().position(|work| can_serve(work.index)) {
                if let Some(work) = state.pending.remove(pos) {
                    state.in_flight.insert(work.index);
                    return Pick::Piece(work);
                }
            }

            if !state.in_flight.iter().any(|&index| can_serve(index)) {
                return Pick::Exhausted;
            }

            if waited {
                return Pick::Idle;
            }

            state = self
                .changed
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            waited = true;
        }
    }

    /// Puts an in-flight piece back at the end of the queue.
    pub fn release(&self, work: PieceWork) {
        let mut state = self.lock();
        state.in_flight.remove(&work.index);
        state.pending.push_back(work);
        self.changed.notify_all();
    }

    /// Marks an in-flight piece as done.
    pub fn complete(&self, index: u32) {
        let mut state = self.lock();
        state.in_flight.remove(&index);
        self.changed.notify_all();
    }

    /// Stops handing out pieces and wakes every waiting worker.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pieces waiting for a worker.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(20);

    fn picker(n: u32) -> PiecePicker {
        PiecePicker::new((0..n).map(|index| PieceWork::new(index, [0; 20], 10)))
    }

    fn index(pick: Pick) -> u32 {
        match pick {
            Pick::Piece(work) => work.index,
            other => panic!("expected a piece, got {:?}", other),
        }
    }

    #[test]
    fn picks_in_index_order() {
        let picker = picker(3);
        assert_eq!(index(picker.pick(|_| true, WAIT)), 0);
        assert_eq!(index(picker.pick(|_| true, WAIT)), 1);
        assert_eq!(index(picker.pick(|_| true, WAIT)), 2);
        assert_eq!(picker.pending(), 0);
    }

    #[test]
    fn skips_pieces_the_peer_lacks() {
        let picker = picker(3);
        assert_eq!(index(picker.pick(|i| i == 2, WAIT)), 2);
        assert_eq!(picker.pick(|i| i == 2, WAIT), Pick::Exhausted);
        assert_eq!(picker.pending(), 2);
    }

    #[test]
    fn released_pieces_go_last() {
        let picker = picker(3);
        let first = match picker.pick(|_| true, WAIT) {
            Pick::Piece(work) => work,
            other => panic!("expected a piece, got {:?}", other),
        };
        picker.release(first);

        assert_eq!(index(picker.pick(|_| true, WAIT)), 1);
        assert_eq!(index(picker.pick(|_| true, WAIT)), 2);
        assert_eq!(index(picker.pick(|_| true, WAIT)), 0);
    }

    #[test]
    fn waits_for_a_piece_held_elsewhere() {
        let picker = Arc::new(picker(1));
        let held = match picker.pick(|_| true, WAIT) {
            Pick::Piece(work) => work,
            other => panic!("expected a piece, got {:?}", other),
        };

        // Only in flight: the second peer idles instead of giving up
        assert_eq!(picker.pick(|_| true, WAIT), Pick::Idle);

        let releaser = {
            let picker = Arc::clone(&picker);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                picker.release(held);
            })
        };

        let picked = loop {
            match picker.pick(|_| true, Duration::from_secs(5)) {
                Pick::Idle => continue,
                pick => break pick,
            }
        };
        assert_eq!(index(picked), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn completed_pieces_exhaust_waiting_peers() {
        let picker = picker(1);
        assert_eq!(index(picker.pick(|_| true, WAIT)), 0);
        picker.complete(0);
        assert_eq!(picker.pick(|_| true, WAIT), Pick::Exhausted);
    }

    #[test]
    fn close_wakes_everyone() {
        let picker = picker(2);
        picker.close();
        assert!(picker.is_closed());
        assert_eq!(picker.pick(|_| true, WAIT), Pick::Closed);
    }
}
