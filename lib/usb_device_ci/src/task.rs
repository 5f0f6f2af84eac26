use crate::error::{Error, Result};
use log::warn;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

/// A shared flag that tells a cohort of endpoint tasks to stop. Every completion wait on a
/// non-control endpoint checks its token, so raising it unblocks tasks waiting on the hardware.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A set of tasks started together and stopped together. All tasks share one
/// [`CancellationToken`]; [`TaskGroup::cancel_and_join`] raises it and waits for every task to
/// exit, so when it returns none of the group's tasks are still touching the hardware.
pub struct TaskGroup {
    token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl TaskGroup {
    pub fn new() -> TaskGroup {
        TaskGroup { token: CancellationToken::new(), tasks: Vec::new() }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: String, task: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Result<()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || task(token))
            .map_err(|err| Error::TaskSpawn(err.to_string()))?;
        self.tasks.push((name, handle));
        Ok(())
    }

    /// Cancel every task in the group and wait for all of them to exit. Returns how each task
    /// exited, in the order they were spawned.
    pub fn cancel_and_join(mut self) -> Vec<Result<()>> {
        self.token.cancel();
        std::mem::take(&mut self.tasks)
            .into_iter()
            .map(|(name, handle)| match handle.join() {
                Ok(result) => result,
                Err(_) => {
                    warn!("Task {} panicked", name);
                    Err(Error::Handler(format!("task {} panicked", name)))
                }
            })
            .collect()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        TaskGroup::new()
    }
}

/// Dropping a group without joining it still stops its tasks, but doesn't wait for them.
impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
