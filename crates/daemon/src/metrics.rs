//! Status snapshot
//!
//! One shared, serializable view of the daemon: queue, active task, download
//! daemon state, host resources and task counters. Written by the scheduler
//! and the resource monitor, read by the status endpoint.

use crate::aria2::DaemonState;
use crate::task::{ProfileOutcome, TaskReport, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::RwLock;

/// The task currently in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveTaskStatus {
    pub id: String,
    pub source: String,
    pub status: String,
    /// Phase of the latest progress record.
    pub phase: Option<String>,
    pub percent: f64,
    pub rate_bytes_per_sec: u64,
    pub eta_secs: Option<u64>,
    /// Set by the watchdog when no progress arrived for the stall threshold.
    pub stalled: bool,
    pub last_progress_unix_ms: i64,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete status snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub queue_len: usize,
    pub active: Option<ActiveTaskStatus>,
    pub daemon_state: DaemonState,
    pub system: SystemMetrics,
    pub memory_pressure: bool,
    pub cpu_pressure: bool,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub total_bytes_delivered: u64,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            queue_len: 0,
            active: None,
            daemon_state: DaemonState::Stopped,
            system: SystemMetrics::default(),
            memory_pressure: false,
            cpu_pressure: false,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            total_bytes_delivered: 0,
        }
    }
}

impl StatusSnapshot {
    /// Fold a finished task into the counters.
    pub fn record_finished(&mut self, report: &TaskReport) {
        match report.status {
            TaskStatus::Completed => self.completed_tasks += 1,
            TaskStatus::Failed => self.failed_tasks += 1,
            TaskStatus::Cancelled => self.cancelled_tasks += 1,
            _ => {}
        }
        self.total_bytes_delivered += report
            .outcomes
            .iter()
            .map(|o| match o {
                ProfileOutcome::Delivered { uploaded_bytes, .. } => *uploaded_bytes,
                _ => 0,
            })
            .sum::<u64>();
    }
}

/// Shared status state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

/// Sample CPU, memory and load. CPU usage needs two refreshes of the same
/// `System` to be meaningful, so callers keep one around between samples.
pub fn collect_system_metrics(sys: &mut System) -> SystemMetrics {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
