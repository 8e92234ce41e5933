//! Periodic host and download daemon checks.
//!
//! Every interval the monitor samples CPU, memory and load, logs when either
//! crosses its warning threshold, probes the download daemon and restarts it
//! when it is gone or unresponsive. Results land in the shared status snapshot.
//! High pressure is reported only; task admission is not throttled.

use crate::aria2::{DaemonState, DaemonSupervisor};
use crate::metrics::{collect_system_metrics, SharedStatus, SystemMetrics};
use crate::task::current_timestamp_ms;
use relay_daemon_config::MonitorConfig;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub memory_warn_percent: f32,
    pub cpu_warn_percent: f32,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            memory_warn_percent: config.memory_warn_percent,
            cpu_warn_percent: config.cpu_warn_percent,
        }
    }
}

/// Pressure flags for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pressure {
    pub memory: bool,
    pub cpu: bool,
}

impl Pressure {
    pub fn assess(metrics: &SystemMetrics, settings: &MonitorSettings) -> Self {
        Self {
            memory: metrics.mem_usage_percent >= settings.memory_warn_percent,
            cpu: metrics.cpu_usage_percent >= settings.cpu_warn_percent,
        }
    }
}

/// What one monitor pass observed and did.
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub system: SystemMetrics,
    pub pressure: Pressure,
    pub daemon_state: DaemonState,
    pub daemon_restarted: bool,
}

pub struct ResourceMonitor {
    supervisor: Arc<DaemonSupervisor>,
    status: SharedStatus,
    settings: MonitorSettings,
    sys: System,
    last_pressure: Pressure,
}

impl ResourceMonitor {
    pub fn new(supervisor: Arc<DaemonSupervisor>, status: SharedStatus, settings: MonitorSettings) -> Self {
        Self {
            supervisor,
            status,
            settings,
            sys: System::new(),
            last_pressure: Pressure::default(),
        }
    }

    /// One pass: sample, log pressure changes, check the daemon, publish.
    pub async fn tick(&mut self) -> MonitorReport {
        let system = collect_system_metrics(&mut self.sys);
        let pressure = Pressure::assess(&system, &self.settings);
        self.log_pressure(&system, pressure);

        let daemon_restarted = self.check_daemon().await;
        let daemon_state = self.supervisor.state();

        {
            let mut snapshot = self.status.write().await;
            snapshot.system = system.clone();
            snapshot.memory_pressure = pressure.memory;
            snapshot.cpu_pressure = pressure.cpu;
            snapshot.daemon_state = daemon_state;
            snapshot.timestamp_unix_ms = current_timestamp_ms();
        }

        MonitorReport {
            system,
            pressure,
            daemon_state,
            daemon_restarted,
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.settings.interval.as_secs(), "resource monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("resource monitor stopped");
    }

    fn log_pressure(&mut self, system: &SystemMetrics, pressure: Pressure) {
        if pressure.memory && !self.last_pressure.memory {
            warn!(
                mem_usage_percent = system.mem_usage_percent,
                threshold = self.settings.memory_warn_percent,
                "memory pressure high"
            );
        } else if !pressure.memory && self.last_pressure.memory {
            info!(mem_usage_percent = system.mem_usage_percent, "memory pressure back to normal");
        }
        if pressure.cpu && !self.last_pressure.cpu {
            warn!(
                cpu_usage_percent = system.cpu_usage_percent,
                threshold = self.settings.cpu_warn_percent,
                "CPU pressure high"
            );
        } else if !pressure.cpu && self.last_pressure.cpu {
            info!(cpu_usage_percent = system.cpu_usage_percent, "CPU pressure back to normal");
        }
        self.last_pressure = pressure;
    }

    /// Restart the daemon if it was started once and no longer answers.
    /// Returns whether a restart succeeded.
    async fn check_daemon(&self) -> bool {
        let generation = self.supervisor.generation();
        if generation == 0 {
            return false;
        }
        if matches!(
            self.supervisor.state(),
            DaemonState::Starting | DaemonState::Restarting
        ) {
            return false;
        }
        if self.supervisor.ensure_healthy().await {
            return false;
        }

        warn!(generation, "download daemon missing or unresponsive");
        match self.supervisor.restart(generation).await {
            Ok(handle) => {
                info!(generation = handle.generation, "download daemon restarted by monitor");
                true
            }
            Err(err) => {
                error!(error = %err, "download daemon restart failed");
                false
            }
        }
    }
}
