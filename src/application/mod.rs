pub mod balance_snapshot_recorder;
pub mod execution_engine;
pub mod job_queue_worker;
pub mod position_lock;
pub mod position_supervisor;
pub mod signal_intake_service;
pub mod supervisor_task;

pub use balance_snapshot_recorder::BalanceSnapshotRecorder;
pub use execution_engine::ExecutionEngine;
pub use job_queue_worker::JobQueueWorkerPool;
pub use position_lock::PositionLockRegistry;
pub use position_supervisor::PositionSupervisor;
pub use signal_intake_service::{IntakeOutcome, IntakeRejection, IntakeRequest, SignalIntakeService};
pub use supervisor_task::SupervisorTask;
