//! Worker contexts
//!
//! The orchestrator owns every [`WorkerContext`] in a [`WorkerArena`]. During
//! a phase each worker thread receives exclusive `&mut` access to exactly one
//! context, so sessions and generators are never shared.

use tracing::{debug, warn};

use crate::affinity;
use crate::engine::KvEngine;
use crate::error::{Error, Result};
use crate::keygen::KeyIndexGenerator;

/// State owned by one worker for the lifetime of a run
#[derive(Debug)]
pub struct WorkerContext<S> {
    index: usize,
    cpu: Option<usize>,
    session: S,
    generator: KeyIndexGenerator,
    pinned: bool,
}

impl<S> WorkerContext<S> {
    /// Context for worker `index` wrapping its engine session
    pub fn new(index: usize, cpu: Option<usize>, session: S) -> Self {
        Self {
            index,
            cpu,
            session,
            generator: KeyIndexGenerator::for_worker(index),
            pinned: false,
        }
    }

    /// Worker index
    pub fn index(&self) -> usize {
        self.index
    }

    /// CPU this worker asks to run on
    pub fn cpu(&self) -> Option<usize> {
        self.cpu
    }

    /// Whether the last pin attempt succeeded
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Engine session
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Key-index generator
    pub fn generator(&self) -> &KeyIndexGenerator {
        &self.generator
    }

    /// Session and generator together, for the query loop
    pub fn parts_mut(&mut self) -> (&mut S, &mut KeyIndexGenerator) {
        (&mut self.session, &mut self.generator)
    }

    /// Pin the calling thread to this worker's CPU.
    ///
    /// Failures are logged and the worker continues unpinned.
    pub fn pin_current_thread(&mut self) -> bool {
        let Some(cpu) = self.cpu else {
            return false;
        };
        self.pinned = match affinity::pin_current_thread(cpu) {
            Ok(()) => {
                debug!(worker = self.index, cpu, "pinned worker");
                true
            }
            Err(err) => {
                warn!(worker = self.index, cpu, error = %err, "running unpinned");
                false
            }
        };
        self.pinned
    }

    /// Consume the context, returning its session
    pub fn into_session(self) -> S {
        self.session
    }
}

/// Owned, index-addressed collection of worker contexts
#[derive(Debug)]
pub struct WorkerArena<S> {
    workers: Vec<WorkerContext<S>>,
}

impl<S> WorkerArena<S> {
    /// Open one session per worker against `engine`.
    ///
    /// With `pin` set, worker `i` targets the `i`-th CPU of the process's
    /// affinity mask, wrapping around when there are more workers than CPUs.
    pub fn build<E>(engine: &E, workers: usize, pin: bool) -> Result<Self>
    where
        E: KvEngine<Session = S>,
    {
        let cpus = affinity::allowed_cpus();
        let pin = pin && affinity::is_supported();
        let workers = (0..workers)
            .map(|index| -> Result<WorkerContext<S>> {
                let session = engine
                    .open_session(index)
                    .map_err(|reason| Error::Session { worker: index, reason })?;
                let cpu = if pin {
                    cpus.get(index % cpus.len().max(1)).copied()
                } else {
                    None
                };
                Ok(WorkerContext::new(index, cpu, session))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { workers })
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether there are no workers
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Context of worker `index`
    pub fn get(&self, index: usize) -> Option<&WorkerContext<S>> {
        self.workers.get(index)
    }

    /// All contexts, for handing out to a phase
    pub fn as_mut_slice(&mut self) -> &mut [WorkerContext<S>] {
        &mut self.workers
    }

    /// Close the arena, returning sessions in worker order
    pub fn into_sessions(self) -> Vec<S> {
        self.workers
            .into_iter()
            .map(WorkerContext::into_session)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;

    #[test]
    fn test_contexts_are_independent() {
        let engine = InMemoryEngine::new();
        let mut arena = WorkerArena::build(&engine, 4, false).unwrap();
        assert_eq!(arena.len(), 4);

        for (i, ctx) in arena.as_mut_slice().iter_mut().enumerate() {
            assert_eq!(ctx.index(), i);
            assert_eq!(ctx.cpu(), None);
            assert_eq!(ctx.session_mut().worker(), i);
            assert_eq!(ctx.generator(), &KeyIndexGenerator::for_worker(i));
        }

        // advancing one generator leaves the others alone
        let (_, generator) = arena.as_mut_slice()[0].parts_mut();
        generator.next();
        assert_ne!(
            arena.get(0).unwrap().generator(),
            &KeyIndexGenerator::for_worker(0)
        );
        assert_eq!(
            arena.get(1).unwrap().generator(),
            &KeyIndexGenerator::for_worker(1)
        );
    }

    #[test]
    fn test_unset_cpu_does_not_pin() {
        let mut ctx = WorkerContext::new(0, None, ());
        assert!(!ctx.pin_current_thread());
        assert!(!ctx.is_pinned());
    }

    #[test]
    fn test_bad_cpu_is_not_fatal() {
        let mut ctx = WorkerContext::new(0, Some(usize::MAX), ());
        let pinned = std::thread::scope(|s| s.spawn(|| ctx.pin_current_thread()).join().unwrap());
        assert!(!pinned);
    }

    #[test]
    fn test_pin_targets_come_from_affinity_mask() {
        let engine = InMemoryEngine::new();
        let allowed = affinity::allowed_cpus();
        let workers = allowed.len() + 2;
        let mut arena = WorkerArena::build(&engine, workers, true).unwrap();

        for ctx in arena.as_mut_slice() {
            if affinity::is_supported() {
                let cpu = ctx.cpu().unwrap();
                assert!(allowed.contains(&cpu));
                assert_eq!(cpu, allowed[ctx.index() % allowed.len()]);
            } else {
                assert_eq!(ctx.cpu(), None);
            }
        }
    }

    #[test]
    fn test_sessions_returned_in_order() {
        let engine = InMemoryEngine::new();
        let arena = WorkerArena::build(&engine, 3, true).unwrap();
        let workers: Vec<usize> = arena.into_sessions().iter().map(|s| s.worker()).collect();
        assert_eq!(workers, vec![0, 1, 2]);
    }
}
