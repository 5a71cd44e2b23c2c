//! Process-level CPU/memory metrics, registered on the same `prometheus`
//! default registry the control surface's `/metrics` endpoint renders.
//! Shutdown is driven by the shared `CancellationToken` the rest of this
//! crate uses, rather than a bespoke notice channel of its own.

use std::time::Duration;

use chrono::Utc;
use prometheus::{register_gauge, register_int_gauge};
use simple_process_stats::ProcessStats;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Registers the process gauges and polls them every ten seconds until
/// `closer` is cancelled.
pub async fn run_process_monitoring(closer: CancellationToken) {
    let start_time_seconds = register_gauge!(
        "process_start_time_seconds",
        "UTC timestamp (in seconds) of when the process started."
    )
    .unwrap();
    let cpu_user_seconds_total = register_gauge!(
        "process_cpu_user_seconds_total",
        "Cumulative number of seconds spent executing in user mode"
    )
    .unwrap();
    let cpu_system_seconds_total = register_gauge!(
        "process_cpu_system_seconds_total",
        "Cumulative number of seconds spent executing in kernel mode"
    )
    .unwrap();
    let resident_memory_bytes = register_int_gauge!(
        "process_resident_memory_bytes",
        "Resident memory usage size as reported by the kernel, in bytes"
    )
    .unwrap();
    start_time_seconds.set(Utc::now().timestamp() as f64);

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = closer.cancelled() => return,
            _ = interval.tick() => {}
        }

        let system_stats = match ProcessStats::get().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "failed to read process CPU/memory statistics");
                continue;
            }
        };

        cpu_user_seconds_total.set(system_stats.cpu_time_user.as_secs_f64());
        cpu_system_seconds_total.set(system_stats.cpu_time_kernel.as_secs_f64());
        resident_memory_bytes.set(system_stats.memory_usage_bytes as i64);
    }
}
