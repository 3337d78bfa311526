//! In-memory launcher for driving the pool without processes.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::PoolError;
use crate::pool::WorkerId;
use crate::process::{LaunchSpec, Launcher, WorkerHandle};

#[derive(Debug, Default)]
struct Log {
    launched: Vec<LaunchSpec>,
    drained: Vec<WorkerId>,
    killed: Vec<WorkerId>,
    failures_left: usize,
}

/// Records every launch, drain and kill. Cloning shares the log.
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    log: Arc<Mutex<Log>>,
}

impl FakeLauncher {
    fn with_log<T>(&self, f: impl FnOnce(&mut Log) -> T) -> T {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut log)
    }

    /// Make the next `n` launches fail.
    pub fn fail_next(&self, n: usize) {
        self.with_log(|log| log.failures_left = n);
    }

    pub fn launched(&self) -> Vec<WorkerId> {
        self.with_log(|log| log.launched.iter().map(|s| s.id).collect())
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.with_log(|log| log.launched.clone())
    }

    pub fn drained(&self) -> Vec<WorkerId> {
        self.with_log(|log| log.drained.clone())
    }

    pub fn killed(&self) -> Vec<WorkerId> {
        self.with_log(|log| log.killed.clone())
    }
}

impl Launcher for FakeLauncher {
    type Handle = FakeHandle;

    fn launch(&mut self, spec: LaunchSpec) -> Result<FakeHandle, PoolError> {
        self.with_log(|log| {
            if log.failures_left > 0 {
                log.failures_left -= 1;
                return Err(PoolError::Launch {
                    id: spec.id,
                    reason: "injected failure".into(),
                });
            }
            log.launched.push(spec);
            Ok(FakeHandle {
                id: spec.id,
                log: Arc::clone(&self.log),
            })
        })
    }
}

#[derive(Debug)]
pub struct FakeHandle {
    id: WorkerId,
    log: Arc<Mutex<Log>>,
}

impl WorkerHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        u32::try_from(self.id.get()).ok().map(|id| 10_000 + id)
    }

    fn drain(&mut self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.drained.push(self.id);
    }

    fn kill(&mut self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.killed.push(self.id);
    }
}
