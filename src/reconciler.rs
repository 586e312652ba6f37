//! The reconciliation loop
//!
//! One cycle: fetch yesterday's report, pick the meters without a reading,
//! resolve each one to a device and send it the re-poll downlink. Cycles
//! repeat forever, paced by the schedule.
//!
//! ```text
//! acquire ─▶ fetch ─▶ detect ─▶ (resolve ─▶ dispatch)* ─▶ sleep(cycle) ─┐
//!    ▲         ▲  │                  │                                  │
//!    └─ 401 ───┼──┴──────────────────┘                                  │
//!              ├── sleep(backoff) ◀── any other error                   │
//!              └────────────────────────────────────────────────────────┘
//! ```

use crate::config::{ReportConfig, ScheduleConfig};
use crate::downlink::{DispatchOutcome, Dispatcher};
use crate::error::{AuthError, CycleError};
use crate::metering::report::{find_missing, ReportLayout};
use crate::metering::{report_window, MeteringClient};
use crate::network_server::NetworkServerClient;
use crate::session::{Session, SessionManager};
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Tally of one finished cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub window: String,
    pub missing: usize,
    pub delivered: usize,
    pub timed_out: usize,
    pub connection_failed: usize,
    pub not_found: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered => self.delivered += 1,
            DispatchOutcome::TimedOut => self.timed_out += 1,
            DispatchOutcome::ConnectionFailed(_) => self.connection_failed += 1,
            DispatchOutcome::NotFound => self.not_found += 1,
        }
    }

    pub fn dispatched(&self) -> usize {
        self.delivered + self.timed_out + self.connection_failed
    }
}

/// What the loop does after one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Session was replaced; fetch again right away
    Refetch,
    /// Cycle failed; retry after the error backoff
    Backoff(Duration),
    /// Cycle finished; start the next one after the cycle interval
    Pace(Duration),
}

impl Next {
    fn delay(&self) -> Duration {
        match self {
            Next::Refetch => Duration::ZERO,
            Next::Backoff(d) | Next::Pace(d) => *d,
        }
    }
}

pub struct Reconciler {
    sessions: SessionManager,
    metering: MeteringClient,
    network_server: NetworkServerClient,
    dispatcher: Dispatcher,
    layout: ReportLayout,
    cutoff_hour: u32,
    dump_path: Option<PathBuf>,
    schedule: ScheduleConfig,
    session: Session,
}

impl Reconciler {
    /// Log in to both upstreams; a failure here means the loop never starts
    pub async fn start(
        sessions: SessionManager,
        metering: MeteringClient,
        network_server: NetworkServerClient,
        dispatcher: Dispatcher,
        report: &ReportConfig,
        schedule: ScheduleConfig,
    ) -> Result<Self, AuthError> {
        let session = sessions.acquire().await?;
        info!("Initial authentication succeeded");

        Ok(Self {
            sessions,
            metering,
            network_server,
            dispatcher,
            layout: ReportLayout::from(report),
            cutoff_hour: report.cutoff_hour,
            dump_path: report.dump_path.as_ref().map(PathBuf::from),
            schedule,
            session,
        })
    }

    /// Run cycles forever
    pub async fn run(&mut self) {
        loop {
            let next = self.step().await;
            tokio::time::sleep(next.delay()).await;
        }
    }

    /// Run one cycle and decide what comes next
    pub async fn step(&mut self) -> Next {
        match self.run_cycle().await {
            Ok(summary) => {
                info!(
                    "Cycle for {} complete: {} missing, {} delivered, {} timed out, {} failed, {} not found. Sleeping {:?}...",
                    summary.window,
                    summary.missing,
                    summary.delivered,
                    summary.timed_out,
                    summary.connection_failed,
                    summary.not_found,
                    self.schedule.cycle_interval()
                );
                Next::Pace(self.schedule.cycle_interval())
            }
            Err(e) if e.is_auth_expired() => {
                warn!("{}, re-authenticating", e);
                match self.reauthenticate().await {
                    Ok(()) => Next::Refetch,
                    Err(e) => {
                        error!("Re-authentication failed: {}", e);
                        Next::Backoff(self.schedule.error_backoff())
                    }
                }
            }
            Err(e) => {
                error!(
                    "Cycle failed: {}. Retrying in {:?}",
                    e,
                    self.schedule.error_backoff()
                );
                Next::Backoff(self.schedule.error_backoff())
            }
        }
    }

    /// Replace the whole session; the old one is dropped only on success
    async fn reauthenticate(&mut self) -> Result<(), AuthError> {
        let session = self.sessions.acquire().await?;
        info!(
            "Session renewed (previous one issued at {})",
            self.session.issued_at.format("%Y-%m-%d %H:%M:%S")
        );
        self.session = session;
        Ok(())
    }

    /// One cycle for `--once`, renewing the session and retrying once on 401
    pub async fn run_once(&mut self) -> Result<CycleSummary, CycleError> {
        match self.run_cycle().await {
            Err(e) if e.is_auth_expired() => {
                warn!("{}, re-authenticating", e);
                self.reauthenticate().await?;
                self.run_cycle().await
            }
            result => result,
        }
    }

    /// Fetch → detect → resolve/dispatch for the report window ending yesterday
    pub async fn run_cycle(&self) -> Result<CycleSummary, CycleError> {
        let window = report_window(Local::now().date_naive(), self.cutoff_hour);
        info!("Checking readings for {}...", window);

        let report = self
            .metering
            .fetch_report(&self.session, &window, &window, self.metering.meters())
            .await?;
        if let Some(path) = &self.dump_path {
            report.dump(path).await;
        }

        let missing = find_missing(&report, &self.layout)?;
        info!("Meters without a reading: {}", missing.len());

        let mut summary = CycleSummary {
            window,
            missing: missing.len(),
            ..CycleSummary::default()
        };

        for (i, entity) in missing.iter().enumerate() {
            let n = i + 1;
            let Some(device) = self.network_server.resolve(&self.session, entity).await? else {
                warn!("[{}] Meter {} not found on the network server", n, entity);
                summary.record(&DispatchOutcome::NotFound);
                continue;
            };

            info!(
                "[{}] Re-polling meter {} (device {}, application {})",
                n, entity, device.device_eui, device.application_id
            );
            let outcome = self
                .dispatcher
                .dispatch(&device.device_eui, &device.application_id)
                .await;
            summary.record(&outcome);

            tokio::time::sleep(self.schedule.dispatch_interval()).await;
        }

        Ok(summary)
    }
}
