//! Transfer sagas and distributed transaction coordination.
//!
//! This crate provides:
//! - `SagaOrchestrator`, which runs steps in order and compensates the
//!   committed ones newest first when a step fails
//! - The `ReserveFromAccount` and `CreditToAccount` transfer steps
//! - `TransferService`, which runs a transfer and publishes its events under
//!   a per-class publish policy
//! - `DistributedTransactionCoordinator`, a prepare/commit/abort state
//!   machine with a bounded prepare phase

pub mod coordinator;
pub mod error;
pub mod orchestrator;
pub mod participant;
pub mod service;
pub mod step;
pub mod transfer;

pub use coordinator::{CoordinatorConfig, DistributedTransactionCoordinator};
pub use error::{AbortReason, CoordinatorError, ParticipantError, SagaError, StepError, TransferError};
pub use orchestrator::{BoxedStep, CompletedSaga, SagaOrchestrator};
pub use participant::{
    LedgerTransferParticipant, Participant, PrepareAnnouncer, PrepareOutcome, Vote, VoteCollector,
};
pub use service::{
    PublishPolicies, PublishPolicy, RequestContext, TransferReceipt, TransferRequest,
    TransferService,
};
pub use step::{BalanceChange, SagaStep};
pub use transfer::{CreditToAccount, ReserveFromAccount, transfer_steps};
