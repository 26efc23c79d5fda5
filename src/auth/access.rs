use std::sync::Arc;

use thiserror::Error;
use tonic::{Request, Status};
use uuid::Uuid;

use crate::auth::identity::PeerIdentity;
use crate::auth::ownership::{OwnershipError, OwnershipStore};
use crate::auth::roles::Role;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No verified client certificate")]
    MissingIdentity,

    #[error("Invalid client certificate: {0}")]
    InvalidCertificate(String),

    #[error("Client certificate has no common name")]
    MissingCommonName,

    #[error("{caller} holds none of the roles allowed for {method}")]
    RoleNotAllowed { caller: String, method: &'static str },

    #[error("{method} requires a job ID")]
    MissingJobId { method: &'static str },

    #[error("{caller} does not own job {job_id}")]
    NotOwner { caller: String, job_id: String },

    #[error(transparent)]
    Ownership(#[from] OwnershipError),
}

/// Every denial looks the same to the caller.
impl From<AuthError> for Status {
    fn from(_: AuthError) -> Self {
        Status::permission_denied("Permission denied")
    }
}

/// RPCs guarded by the access controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    StartJob,
    StopJob,
    GetJobStatus,
    GetOutputStream,
}

impl Method {
    pub fn full_name(&self) -> &'static str {
        match self {
            Method::StartJob => "/jobworker.JobWorker/StartJob",
            Method::StopJob => "/jobworker.JobWorker/StopJob",
            Method::GetJobStatus => "/jobworker.JobWorker/GetJobStatus",
            Method::GetOutputStream => "/jobworker.JobWorker/GetOutputStream",
        }
    }

    pub fn allowed_roles(&self) -> &'static [Role] {
        match self {
            Method::StartJob | Method::StopJob | Method::GetJobStatus | Method::GetOutputStream => {
                &[Role::Admin, Role::User]
            }
        }
    }

    /// Whether the call addresses an existing job and so needs an ownership check.
    pub fn targets_job(&self) -> bool {
        !matches!(self, Method::StartJob)
    }
}

/// Decides whether a caller may invoke a method, and on which job.
pub struct AccessController {
    owners: Arc<OwnershipStore>,
}

impl AccessController {
    pub fn new(owners: Arc<OwnershipStore>) -> Self {
        Self { owners }
    }

    /// Role check followed, for job-targeting calls by non-administrators,
    /// by an ownership check. Returns the caller's identity on success.
    pub fn authorize(
        &self,
        identity: Option<&PeerIdentity>,
        method: Method,
        job_id: Option<&str>,
    ) -> Result<PeerIdentity, AuthError> {
        let identity = identity.ok_or(AuthError::MissingIdentity)?;

        if !identity.has_any_role(method.allowed_roles()) {
            return Err(AuthError::RoleNotAllowed {
                caller: identity.name.clone(),
                method: method.full_name(),
            });
        }

        if !method.targets_job() || identity.is_admin() {
            return Ok(identity.clone());
        }

        let job_id = job_id.ok_or(AuthError::MissingJobId {
            method: method.full_name(),
        })?;
        let not_owner = || AuthError::NotOwner {
            caller: identity.name.clone(),
            job_id: job_id.to_string(),
        };

        // A malformed ID can never have an owner.
        let id = Uuid::parse_str(job_id).map_err(|_| not_owner())?;
        let owner = self.owners.get_owner(&id)?;
        if owner != identity.name {
            return Err(not_owner());
        }

        Ok(identity.clone())
    }

    /// [`authorize`](Self::authorize) against the identity the
    /// [`authenticate`] interceptor attached to the request.
    pub fn authorize_request<T>(
        &self,
        request: &Request<T>,
        method: Method,
        job_id: Option<&str>,
    ) -> Result<PeerIdentity, Status> {
        let identity = request.extensions().get::<PeerIdentity>();
        self.authorize(identity, method, job_id).map_err(|e| {
            tracing::warn!(method = method.full_name(), error = %e, "Call denied");
            Status::from(e)
        })
    }

    /// Binds a freshly started job to its creator.
    pub fn record_owner(&self, identity: &PeerIdentity, job_id: Uuid) -> Result<(), OwnershipError> {
        self.owners.set_owner(job_id, &identity.name)
    }
}

/// Interceptor resolving the caller's identity from the verified client
/// certificate and attaching it to the request. Fails closed.
pub fn authenticate(mut request: Request<()>) -> Result<Request<()>, Status> {
    let identity = peer_identity(&request).map_err(|e| {
        tracing::warn!(error = %e, "Rejecting unauthenticated call");
        Status::from(e)
    })?;
    request.extensions_mut().insert(identity);
    Ok(request)
}

fn peer_identity<T>(request: &Request<T>) -> Result<PeerIdentity, AuthError> {
    let certs = request.peer_certs().ok_or(AuthError::MissingIdentity)?;
    let leaf = certs.first().ok_or(AuthError::MissingIdentity)?;
    PeerIdentity::from_der(leaf.as_ref())
}
