//! Per-recipe phase coordination.
//!
//! Each recipe carries one [`ExecutionContext`]: a mutex-guarded
//! current/target phase pair, a condition variable every state change
//! notifies, and an atomic mirror of `current_phase` for lock-free reads.
//! Workers advance `current`; any thread may raise `target`. Both are
//! monotonic, and all waits are predicate-guarded.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::Error;
use crate::key::RecipeKey;
use crate::phase::Phase;

struct CoordState {
    current: Phase,
    target: Phase,
    failed: bool,
    started: bool,
    ancestors: Vec<RecipeKey>,
    worker: Option<JoinHandle<()>>,
    error: Option<Error>,
}

pub struct ExecutionContext {
    state: Mutex<CoordState>,
    cv: Condvar,
    current_atomic: AtomicU8,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

/// What `raise_target` asks the caller to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// Worker already running (or already asked to start); nothing to do.
    Notified,
    /// First raise: the caller must spawn this recipe's worker.
    SpawnWorker,
}

impl ExecutionContext {
    pub fn new() -> ExecutionContext {
        ExecutionContext {
            state: Mutex::new(CoordState {
                current: Phase::None,
                target: Phase::None,
                failed: false,
                started: false,
                ancestors: Vec::new(),
                worker: None,
                error: None,
            }),
            cv: Condvar::new(),
            current_atomic: AtomicU8::new(Phase::None as u8),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordState> {
        self.state.lock().expect("execution context poisoned")
    }

    /// Last completed phase, lock-free.
    pub fn current(&self) -> Phase {
        Phase::from_u8(self.current_atomic.load(Ordering::Acquire))
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    /// Raise `target_phase` monotonically (never lowered) and wake the
    /// worker. The first call flips `started` and tells the caller to spawn.
    pub fn raise_target(&self, phase: Phase) -> RaiseOutcome {
        let mut state = self.lock();
        if phase > state.target {
            state.target = phase;
        }
        let outcome = if state.started {
            RaiseOutcome::Notified
        } else {
            state.started = true;
            RaiseOutcome::SpawnWorker
        };
        self.cv.notify_all();
        outcome
    }

    /// Record the fetch-path ancestor chain before the worker starts.
    pub fn set_ancestors(&self, ancestors: Vec<RecipeKey>) {
        self.lock().ancestors = ancestors;
    }

    pub fn ancestors(&self) -> Vec<RecipeKey> {
        self.lock().ancestors.clone()
    }

    pub fn set_worker(&self, handle: JoinHandle<()>) {
        self.lock().worker = Some(handle);
    }

    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.lock().worker.take()
    }

    /// Worker loop entry: block until there is a phase to run, then return
    /// it. `None` means the pipeline finished or this recipe failed.
    pub fn next_phase(&self) -> Option<Phase> {
        let mut state = self.lock();
        while state.current >= state.target && !state.failed {
            state = self.cv.wait(state).expect("execution context poisoned");
        }
        if state.failed {
            return None;
        }
        state.current.successor()
    }

    /// Worker loop exit for one phase: publish completion and wake waiters.
    pub fn complete_phase(&self, phase: Phase) {
        let mut state = self.lock();
        debug_assert!(phase > state.current, "phase completion must be monotonic");
        state.current = phase;
        self.current_atomic.store(phase as u8, Ordering::Release);
        self.cv.notify_all();
    }

    /// Check phase shortcut: jump `current` to `deploy` so the only phase
    /// left is completion. Waiters on any skipped phase observe the jump.
    pub fn skip_to_deploy(&self) {
        let mut state = self.lock();
        if state.current < Phase::Deploy {
            state.current = Phase::Deploy;
            if state.target < Phase::Deploy {
                state.target = Phase::Deploy;
            }
            self.current_atomic
                .store(Phase::Deploy as u8, Ordering::Release);
            self.cv.notify_all();
        }
    }

    /// Record this recipe's first failure and wake every waiter.
    pub fn fail(&self, error: Error) {
        let mut state = self.lock();
        state.failed = true;
        if state.error.is_none() {
            state.error = Some(error);
        }
        self.cv.notify_all();
    }

    pub fn take_error(&self) -> Option<Error> {
        self.lock().error.take()
    }

    /// Block until this recipe reaches `phase` or fails. `Ok` means the
    /// phase was reached; `Err` means the recipe failed first.
    pub fn wait_for(&self, phase: Phase) -> Result<(), ()> {
        let mut state = self.lock();
        while state.current < phase && !state.failed {
            state = self.cv.wait(state).expect("execution context poisoned");
        }
        if state.current >= phase { Ok(()) } else { Err(()) }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn target_is_monotonic() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.raise_target(Phase::Check), RaiseOutcome::SpawnWorker);
        assert_eq!(ctx.raise_target(Phase::Completion), RaiseOutcome::Notified);
        // Lowering is ignored.
        ctx.raise_target(Phase::RecipeFetch);
        assert_eq!(ctx.next_phase(), Some(Phase::RecipeFetch));
    }

    #[test]
    fn next_phase_walks_to_target() {
        let ctx = ExecutionContext::new();
        ctx.raise_target(Phase::Check);
        assert_eq!(ctx.next_phase(), Some(Phase::RecipeFetch));
        ctx.complete_phase(Phase::RecipeFetch);
        assert_eq!(ctx.current(), Phase::RecipeFetch);
        assert_eq!(ctx.next_phase(), Some(Phase::Check));
        ctx.complete_phase(Phase::Check);
        // Target reached: a further raise is needed before more work.
        ctx.raise_target(Phase::Fetch);
        assert_eq!(ctx.next_phase(), Some(Phase::Fetch));
    }

    #[test]
    fn next_phase_blocks_until_raised() {
        let ctx = Arc::new(ExecutionContext::new());
        ctx.raise_target(Phase::RecipeFetch);
        ctx.complete_phase(Phase::RecipeFetch);

        let ctx2 = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || ctx2.next_phase());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        ctx.raise_target(Phase::Check);
        assert_eq!(handle.join().unwrap(), Some(Phase::Check));
    }

    #[test]
    fn failure_wakes_and_terminates() {
        let ctx = Arc::new(ExecutionContext::new());
        ctx.raise_target(Phase::RecipeFetch);
        ctx.complete_phase(Phase::RecipeFetch);

        let ctx2 = Arc::clone(&ctx);
        let waiter = std::thread::spawn(move || ctx2.wait_for(Phase::Completion));
        let ctx3 = Arc::clone(&ctx);
        let worker = std::thread::spawn(move || ctx3.next_phase());

        ctx.fail(Error::Script(crate::error::ScriptError::UnknownPhase(
            "boom".into(),
        )));
        assert_eq!(waiter.join().unwrap(), Err(()));
        assert_eq!(worker.join().unwrap(), None);
        assert!(ctx.is_failed());
        assert!(ctx.take_error().is_some());
    }

    #[test]
    fn skip_to_deploy_satisfies_intermediate_waiters() {
        let ctx = Arc::new(ExecutionContext::new());
        ctx.raise_target(Phase::Completion);
        ctx.complete_phase(Phase::RecipeFetch);

        let ctx2 = Arc::clone(&ctx);
        let waiter = std::thread::spawn(move || ctx2.wait_for(Phase::Build));

        ctx.skip_to_deploy();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(ctx.next_phase(), Some(Phase::Completion));
    }
}
