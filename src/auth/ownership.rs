use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("No owner recorded for job {0}")]
    NotFound(Uuid),

    #[error("Job {0} already has a different owner")]
    Conflict(Uuid),
}

/// Maps jobs to the principal that started them.
///
/// An owner, once recorded, never changes: the first writer wins.
#[derive(Debug, Default)]
pub struct OwnershipStore {
    owners: DashMap<Uuid, String>,
}

impl OwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `owner` for `job_id`. Repeating the same owner is a no-op;
    /// a different owner is rejected.
    pub fn set_owner(&self, job_id: Uuid, owner: &str) -> Result<(), OwnershipError> {
        match self.owners.entry(job_id) {
            Entry::Occupied(existing) => {
                if existing.get() == owner {
                    return Ok(());
                }
                tracing::error!(
                    job_id = %job_id,
                    owner = %existing.get(),
                    requested = %owner,
                    "Job already owned by another principal"
                );
                Err(OwnershipError::Conflict(job_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
                Ok(())
            }
        }
    }

    pub fn get_owner(&self, job_id: &Uuid) -> Result<String, OwnershipError> {
        self.owners
            .get(job_id)
            .map(|owner| owner.value().clone())
            .ok_or(OwnershipError::NotFound(*job_id))
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
