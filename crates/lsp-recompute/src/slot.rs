//
// slot.rs
//
// Holds the current computation for a key; replaced computations are
// cancelled and their observers redirected to the replacement
//

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::computation::{Completer, Computation};

/// Last-writer-wins holder of "the current computation" for one key.
///
/// [`SupersedingSlot::replace`] hands back a view whose outcome is that of
/// whichever computation is current when the awaited one settles. Outcomes
/// (including failures) of superseded computations are never observed through
/// a view.
pub struct SupersedingSlot<T> {
    current: Arc<ArcSwapOption<Computation<T>>>,
}

impl<T> Clone for SupersedingSlot<T> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
        }
    }
}

impl<T> Default for SupersedingSlot<T> {
    fn default() -> Self {
        Self {
            current: Arc::new(ArcSwapOption::empty()),
        }
    }
}

impl<T> fmt::Debug for SupersedingSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupersedingSlot")
            .field("current", &self.current.load_full().map(|c| c.id()))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> SupersedingSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Computation<T>> {
        self.current.load_full().map(|c| Computation::clone(&c))
    }

    pub fn is_current(&self, computation: &Computation<T>) -> bool {
        self.current
            .load_full()
            .is_some_and(|c| c.same_as(computation))
    }

    /// Install `next` as current, cancel the displaced computation, and return
    /// a view that follows the slot until it settles on the surviving result.
    ///
    /// Cancelling the view interrupts `next`.
    pub fn replace(&self, next: Computation<T>) -> Computation<T> {
        let displaced = self.current.swap(Some(Arc::new(next.clone())));
        if let Some(displaced) = displaced {
            if !displaced.same_as(&next) {
                log::trace!(
                    "Computation {:#x} superseded by {:#x}",
                    displaced.id(),
                    next.id()
                );
                displaced.cancel();
            }
        }

        let target = next.clone();
        let (view, completer) = Computation::pending(move || {
            target.cancel();
            Ok(())
        });
        follow(self.current.clone(), next, completer);
        view
    }

    /// Remove and cancel the current computation.
    ///
    /// Views still waiting settle with the cleared computation's own outcome.
    pub fn clear(&self) -> Option<Computation<T>> {
        let cleared = self.current.swap(None)?;
        cleared.cancel();
        Some(Computation::clone(&cleared))
    }
}

/// Settle `completer` once `candidate` settles, unless it has been superseded,
/// in which case follow the computation that replaced it instead.
fn follow<T: Clone + Send + Sync + 'static>(
    current: Arc<ArcSwapOption<Computation<T>>>,
    candidate: Computation<T>,
    completer: Completer<T>,
) {
    // Compare by id so the continuation does not keep `candidate` alive.
    let candidate_id = candidate.id();
    candidate.on_settled(move |outcome| {
        let latest = current.load_full();
        match latest {
            Some(latest) if latest.id() != candidate_id => {
                log::trace!(
                    "Computation {:#x} settled after being superseded; following {:#x}",
                    candidate_id,
                    latest.id()
                );
                follow(current, Computation::clone(&latest), completer);
            }
            _ => {
                completer.complete(outcome.clone());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputationError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn counted_pending(cancels: &Arc<AtomicUsize>) -> (Computation<u32>, Completer<u32>) {
        let cancels = cancels.clone();
        Computation::pending(move || {
            cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_single_replace_yields_own_result() {
        let slot = SupersedingSlot::new();
        let (computation, completer) = Computation::<u32>::uninterruptible();
        let view = slot.replace(computation.clone());
        assert!(slot.is_current(&computation));
        completer.succeed(4);
        assert_eq!(view.try_result().unwrap().unwrap(), 4);
    }

    #[test]
    fn test_superseded_view_follows_replacement() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let slot = SupersedingSlot::new();
        let (first, first_completer) = counted_pending(&cancels);
        let (second, second_completer) = counted_pending(&cancels);

        let first_view = slot.replace(first.clone());
        let second_view = slot.replace(second);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        // The stale computation finishes first; nobody may observe it.
        first_completer.succeed(1);
        assert!(!first_view.is_done());

        second_completer.succeed(2);
        assert_eq!(first_view.try_result().unwrap().unwrap(), 2);
        assert_eq!(second_view.try_result().unwrap().unwrap(), 2);
        assert_eq!(first.try_result().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_superseded_failure_is_swallowed() {
        let slot = SupersedingSlot::new();
        let (first, first_completer) = Computation::<u32>::uninterruptible();
        let (second, second_completer) = Computation::<u32>::uninterruptible();

        let first_view = slot.replace(first);
        slot.replace(second);
        first_completer.fail(anyhow::anyhow!("stale failure"));
        assert!(!first_view.is_done());

        second_completer.succeed(9);
        assert_eq!(first_view.try_result().unwrap().unwrap(), 9);
    }

    #[test]
    fn test_final_failure_reaches_every_view() {
        let slot = SupersedingSlot::new();
        let (first, first_completer) = Computation::<u32>::uninterruptible();
        let (second, second_completer) = Computation::<u32>::uninterruptible();

        let first_view = slot.replace(first);
        let second_view = slot.replace(second);
        second_completer.fail(anyhow::anyhow!("final failure"));
        drop(first_completer);

        for view in [first_view, second_view] {
            let err = view.try_result().unwrap().unwrap_err();
            assert!(matches!(err, ComputationError::Failed(_)));
        }
    }

    #[test]
    fn test_view_follows_a_chain_of_replacements() {
        let slot = SupersedingSlot::new();
        let (a, a_done) = Computation::<u32>::uninterruptible();
        let (b, b_done) = Computation::<u32>::uninterruptible();
        let (c, c_done) = Computation::<u32>::uninterruptible();

        let view = slot.replace(a);
        slot.replace(b);
        a_done.succeed(1);
        slot.replace(c);
        b_done.succeed(2);
        assert!(!view.is_done());
        c_done.succeed(3);
        assert_eq!(view.try_result().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_completed_current_is_not_redirected() {
        let slot = SupersedingSlot::new();
        let (a, a_done) = Computation::<u32>::uninterruptible();
        let view = slot.replace(a);
        a_done.succeed(1);

        // A later replacement does not rewrite an already-settled view.
        let (b, _b_done) = Computation::<u32>::uninterruptible();
        slot.replace(b);
        assert_eq!(view.try_result().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_cancelling_view_interrupts_installed_computation() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let slot = SupersedingSlot::new();
        let (computation, _completer) = counted_pending(&cancels);
        let view = slot.replace(computation);
        assert!(view.cancel());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_cancels_and_settles_waiters() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let slot = SupersedingSlot::new();
        let (computation, completer) = counted_pending(&cancels);
        let view = slot.replace(computation);

        assert!(slot.clear().is_some());
        assert!(slot.current().is_none());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        completer.complete(Err(ComputationError::Cancelled));
        assert!(view.try_result().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_concurrent_replace_converges_on_last_installed() {
        const RACERS: usize = 16;
        let slot = SupersedingSlot::<u32>::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(RACERS));

        let handles: Vec<_> = (0..RACERS)
            .map(|i| {
                let slot = slot.clone();
                let barrier = barrier.clone();
                let cancels = cancels.clone();
                std::thread::spawn(move || {
                    let (computation, completer) = counted_pending(&cancels);
                    barrier.wait();
                    let view = slot.replace(computation);
                    (i as u32, view, completer)
                })
            })
            .collect();
        let racers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winner = slot.current().unwrap();
        let mut views = Vec::new();
        for (value, view, completer) in racers {
            views.push(view);
            completer.succeed(value);
        }

        let winner_value = winner.try_result().unwrap().unwrap();
        for view in views {
            assert_eq!(view.try_result().unwrap().unwrap(), winner_value);
        }
        assert_eq!(cancels.load(Ordering::SeqCst), RACERS - 1);
    }
}
