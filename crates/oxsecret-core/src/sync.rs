//! Private event loop for blocking variants.
//!
//! Blocking calls that have no native blocking transport counterpart drive the
//! async implementation on a throwaway current-thread runtime owned by the
//! calling thread. Callers must not issue blocking calls from a thread that is
//! already driving a Tokio runtime; doing so is reported as
//! [`ServiceError::NestedBlockingCall`] rather than deadlocking.

use std::future::Future;

use tokio::runtime::{Builder, Handle};
use tracing::trace;

use crate::service::ServiceError;

/// Run `fut` to completion on a private event loop bound to this thread.
pub(crate) fn block_on<F: Future>(fut: F) -> Result<F::Output, ServiceError> {
    if Handle::try_current().is_ok() {
        return Err(ServiceError::NestedBlockingCall);
    }

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ServiceError::Runtime)?;
    trace!("Running blocking call on private event loop");
    Ok(runtime.block_on(fut))
}
