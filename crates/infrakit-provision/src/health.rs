//! Provider heartbeat
//!
//! Periodically runs the provisioner's health check and publishes the result
//! with a heartbeat timestamp.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use infrakit_common::resource::{ProviderHealthStatus, ProviderHealthStatusSpec};
use infrakit_common::store;
use infrakit_common::Result;

use crate::controller::Context;

/// Heartbeat loop for one provider
pub struct HealthReporter {
    ctx: Arc<Context>,
}

impl HealthReporter {
    /// Create a reporter for the provider described by `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Run one health check and publish the result
    pub async fn report_once(&self) -> Result<ProviderHealthStatus> {
        let error = match self.ctx.provisioner.health_check().await {
            Ok(()) => String::new(),
            Err(e) => {
                warn!(provider = %self.ctx.provider_id(), error = %e, "health check failed");
                e.to_string()
            }
        };

        store::modify::<ProviderHealthStatusSpec, _>(
            self.ctx.store.as_ref(),
            self.ctx.provider_id(),
            |status| {
                status.spec.last_heartbeat = Some(Utc::now());
                status.spec.error = error.clone();
                Ok(())
            },
        )
        .await
    }

    /// Report on every interval tick until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.config.health_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(provider = %self.ctx.provider_id(), "health reporter started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.report_once().await {
                        warn!(error = %e, "failed to publish provider health");
                    } else {
                        debug!("heartbeat published");
                    }
                }
            }
        }

        info!(provider = %self.ctx.provider_id(), "health reporter stopped");
    }
}
