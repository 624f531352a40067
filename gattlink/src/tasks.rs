use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, trace};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Keeps a handle to every operation task so that shutdown can wait for
/// them, or abandon them, instead of leaving them detached.
#[derive(Debug)]
pub struct TaskRegistry {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: DashMap<TaskId, (&'static str, JoinHandle<()>)>,
}

impl TaskRegistry {
    pub fn new(runtime: Handle) -> Self {
        TaskRegistry {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: DashMap::new(),
        }
    }

    pub fn spawn<F>(&self, name: &'static str, future: F) -> TaskId
        where F: Future<Output = ()> + Send + 'static
    {
        self.tasks.retain(|_, (_, handle)| !handle.is_finished());

        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = self.runtime.spawn(future);
        trace!("Spawned {} task {}", name, id);
        self.tasks.insert(id, (name, handle));
        id
    }

    /// The number of tracked tasks that haven't finished yet
    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|entry| !entry.value().1.is_finished()).count()
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.tasks.get(&id).map_or(false, |entry| !entry.value().1.is_finished())
    }

    /// Waits up to `grace` for every tracked task to finish, then aborts the
    /// rest and waits for them to be dropped. Returns how many tasks had to be
    /// aborted.
    ///
    /// Tasks spawned while this runs aren't waited for.
    pub async fn settle(&self, grace: Option<Duration>) -> usize {
        let ids: Vec<TaskId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        let mut tasks: Vec<(TaskId, &'static str, JoinHandle<()>)> =
            ids.into_iter()
               .filter_map(|id| self.tasks.remove(&id))
               .map(|(id, (name, handle))| (id, name, handle))
               .collect();
        tasks.sort_by_key(|(id, _, _)| *id);

        let deadline = grace.map(|grace| Instant::now() + grace);
        let mut abandoned = 0;
        for (id, name, mut handle) in tasks {
            let finished = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, &mut handle).await.is_ok(),
                None => false,
            };
            if finished {
                continue;
            }

            if !handle.is_finished() {
                debug!("Abandoning {} task {}", name, id);
                handle.abort();
                abandoned += 1;
            }
            // Wait for the task to actually be dropped
            let _ = handle.await;
        }
        abandoned
    }
}
