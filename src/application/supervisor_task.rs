use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use super::balance_snapshot_recorder::BalanceSnapshotRecorder;
use super::position_supervisor::PositionSupervisor;

/// Drives the Position Supervisor and balance-snapshot recorder on their own
/// periodic ticks, independent of the job-queue worker pool (spec §4.2,
/// §5 "single-instance mutual exclusion" — one `tokio::time::interval` loop
/// per concern, never two overlapping ticks of the same kind).
pub struct SupervisorTask {
    pub position_supervisor: Arc<PositionSupervisor>,
    pub balance_snapshot_recorder: Arc<BalanceSnapshotRecorder>,
    pub tick_interval: Duration,
    pub balance_snapshot_interval: Duration,
}

impl SupervisorTask {
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let positions = self.clone();
        let position_handle = tokio::spawn(async move { positions.run_position_loop().await });

        let balances = self.clone();
        let balance_handle = tokio::spawn(async move { balances.run_balance_loop().await });

        vec![position_handle, balance_handle]
    }

    async fn run_position_loop(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            info!("position supervisor tick starting");
            if let Err(e) = self.position_supervisor.tick().await {
                error!(error = %e, "position supervisor tick failed, will retry next tick");
            }
        }
    }

    async fn run_balance_loop(&self) {
        let mut interval = tokio::time::interval(self.balance_snapshot_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.balance_snapshot_recorder.run().await {
                error!(error = %e, "balance snapshot recording failed, will retry next tick");
            }
        }
    }
}
