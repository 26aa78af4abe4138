//! Reconciliation scheduler: re-runs dispatch for every ready tenant on a
//! fixed interval so contacts that arrived while a tenant was offline, or
//! whose sends failed, are eventually flushed.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{dispatch::Dispatcher, registry::SessionRegistry, types::DispatchOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub tenants: usize,
    pub sent: usize,
    pub failed_tenants: usize,
}

pub struct ReconciliationScheduler {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(registry: Arc<SessionRegistry>, dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            registry,
            dispatcher,
            interval,
        }
    }

    /// One reconciliation round. Tenants are dispatched concurrently and a
    /// failing tenant never affects the others.
    pub async fn run_tick(&self) -> TickSummary {
        let tenants = self.registry.ready_tenants();
        if tenants.is_empty() {
            debug!("reconcile tick, no ready sessions");
            return TickSummary::default();
        }

        let passes = tenants.iter().map(|tenant_id| async move {
            (tenant_id, self.dispatcher.dispatch_pending(tenant_id).await)
        });
        let mut summary = TickSummary {
            tenants: tenants.len(),
            ..TickSummary::default()
        };
        for (tenant_id, result) in join_all(passes).await {
            match result {
                Ok(report) => {
                    summary.sent += report.sent_count;
                    if report.outcome == DispatchOutcome::Interrupted {
                        debug!(tenant_id = %tenant_id, "reconcile pass interrupted");
                    }
                }
                Err(err) => {
                    summary.failed_tenants += 1;
                    warn!(tenant_id = %tenant_id, error = %err, "reconcile pass failed");
                }
            }
        }
        info!(
            tenants = summary.tenants,
            sent = summary.sent,
            failed = summary.failed_tenants,
            "reconcile tick finished"
        );
        summary
    }

    /// Starts the loop. It stops once `shutdown` flips to true or its sender
    /// is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately; startup has nothing to reconcile yet
            ticker.tick().await;
            info!(interval_secs = self.interval.as_secs(), "reconciliation scheduler started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_tick().await;
                    }
                }
            }
            info!("reconciliation scheduler stopped");
        })
    }
}
