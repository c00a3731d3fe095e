use std::time::Duration;

use clap::Parser;
use dds_common::ObjectKey;

use crate::mutator::MAX_RETRIES;
use crate::reconcile::ReconcileSettings;

#[derive(Debug, Parser)]
#[command(name = "dds-scaler", about = "Scales fabric-attached devices onto nodes to match claims")]
pub struct Args {
    #[arg(long, env = "DDS_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Seconds between full reconcile cycles.
    #[arg(long, default_value_t = 60)]
    pub scan_interval_secs: u64,

    /// Seconds a device stays protected from removal after its last use.
    #[arg(long, default_value_t = 600)]
    pub device_no_removal_secs: u64,

    /// Seconds a claim may wait for device binding before it is rescheduled.
    #[arg(long, default_value_t = 600)]
    pub device_no_allocation_secs: u64,

    #[arg(long, default_value = "composable-dra")]
    pub config_namespace: String,

    #[arg(long, default_value = "composable-dra-dds")]
    pub config_name: String,

    #[arg(long, default_value_t = 9464)]
    pub metrics_port: u16,

    /// OTLP/HTTP endpoint for trace export. Stdout logging only when unset.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    /// Change events closer together than this share one cycle.
    #[arg(long, default_value_t = 500)]
    pub trigger_debounce_ms: u64,
}

/// Longest window accepted, about a century.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

impl Args {
    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            device_no_removal: seconds(self.device_no_removal_secs),
            device_no_allocation: seconds(self.device_no_allocation_secs),
            policy_source: ObjectKey::namespaced(&self.config_namespace, &self.config_name),
            max_attempts: MAX_RETRIES,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn trigger_debounce(&self) -> Duration {
        Duration::from_millis(self.trigger_debounce_ms)
    }
}
