use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{JobError, JobResult};
use crate::jobs::id::JobId;
use crate::jobs::storage::{Job, JobStorage, StorageStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Running,
    Deleting,
}

type BusySet = Arc<Mutex<HashMap<JobId, Activity>>>;

/// Job listing and deletion, aware of which jobs have a pipeline running.
///
/// Cloning is cheap; clones share the set of busy jobs. The lock on that set
/// only guards the bookkeeping, never filesystem work.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    storage: JobStorage,
    busy: BusySet,
}

/// Marks a job as busy (running or being deleted) until dropped.
#[derive(Debug)]
pub struct JobGuard {
    id: JobId,
    busy: BusySet,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        lock(&self.busy).remove(&self.id);
    }
}

fn lock(busy: &Mutex<HashMap<JobId, Activity>>) -> MutexGuard<'_, HashMap<JobId, Activity>> {
    // The map stays consistent even if a holder panicked.
    busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobRegistry {
    pub fn new(storage: JobStorage) -> Self {
        Self {
            storage,
            busy: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> &JobStorage {
        &self.storage
    }

    /// Every job with its artifact names. Jobs deleted mid-scan are left out.
    pub fn list(&self) -> JobResult<BTreeMap<JobId, BTreeSet<String>>> {
        let mut jobs = BTreeMap::new();
        for id in self.storage.list_jobs()? {
            match self.storage.list_artifacts(&id) {
                Ok(artifacts) => {
                    jobs.insert(id, artifacts);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    pub fn inspect(&self, id: &JobId) -> JobResult<Job> {
        self.storage.inspect(id)
    }

    pub fn is_running(&self, id: &JobId) -> bool {
        lock(&self.busy).get(id) == Some(&Activity::Running)
    }

    fn mark(&self, id: &JobId, activity: Activity) -> JobResult<JobGuard> {
        let mut busy = lock(&self.busy);
        if busy.contains_key(id) {
            return Err(JobError::JobBusy(id.to_string()));
        }
        busy.insert(id.clone(), activity);
        Ok(JobGuard {
            id: id.clone(),
            busy: Arc::clone(&self.busy),
        })
    }

    /// Delete a job. Fails with `JobBusy` while its pipeline is running.
    pub fn delete(&self, id: &JobId) -> JobResult<()> {
        let _deleting = self.mark(id, Activity::Deleting)?;
        self.storage.delete_job(id)?;
        Ok(())
    }

    /// Mark a job as running. Fails if it is unknown, running or being deleted.
    pub fn claim(&self, id: &JobId) -> JobResult<JobGuard> {
        let guard = self.mark(id, Activity::Running)?;
        if !self.storage.job_dir(id).is_dir() {
            return Err(JobError::NotFound(format!("job {id}")));
        }
        Ok(guard)
    }

    /// Remove jobs older than `retention_days`, never touching busy ones.
    /// Returns the number of bytes freed.
    pub fn prune(&self, retention_days: u32) -> JobResult<u64> {
        let mut bytes_freed = 0;
        for id in self.storage.expired_jobs(retention_days)? {
            let Ok(_deleting) = self.mark(&id, Activity::Deleting) else {
                tracing::debug!("Skipping busy job {} during prune", id);
                continue;
            };
            match self.storage.delete_job(&id) {
                Ok(size) => {
                    bytes_freed += size;
                    tracing::info!("Pruned old job: {} ({} bytes)", id, size);
                }
                // Deleted by someone else in the meantime.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(bytes_freed)
    }

    pub fn stats(&self) -> JobResult<StorageStats> {
        self.storage.stats()
    }
}
