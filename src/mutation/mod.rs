//! Optimistic mutations with retry, rollback, audit and undo.

mod coordinator;
mod retry;
mod types;

pub use coordinator::{CoordinatorSettings, MutationCoordinator};
pub use retry::RetryPolicy;
pub use types::{
  MutationId, MutationKind, MutationOutcome, MutationRequest, MutationStatus, PendingMutation,
  SubmitOptions,
};
