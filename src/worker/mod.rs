//! Job execution on a broker node.
//!
//! - **Execution**: [`JobExecutor`] takes a claimed job from authentication
//!   to container removal and records the outcome
//! - **Kill requests**: [`KillCoordinator`] stops containers of jobs that
//!   were asked to terminate
//!
//! # Execution Flow
//!
//! 1. Bail out if a kill was requested before the job started
//! 2. Log in to the secret broker with the job's wrapped secret id
//! 3. Decrypt the payload and check it belongs to the job's queue
//! 4. Unpack the content archive and its meta file
//! 5. Pick and pull the image
//! 6. Create the container and read the image's meta file
//! 7. Resolve secret references into a secrets file
//! 8. Bail out if a kill was requested meanwhile
//! 9. Copy content, secrets and the service account in, then start
//! 10. Wait, collect logs and record the result
//!
//! The container is removed on every path once it exists, and the job's
//! token is revoked on every path once it was issued.

pub mod archive;
pub mod executor;
pub mod kill;
pub mod meta;
pub mod secrets;

pub use executor::{ExecutionResult, JobExecutor, JobFailure};
pub use kill::KillCoordinator;
