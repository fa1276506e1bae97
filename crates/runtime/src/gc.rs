//! The distributed garbage collector.
//!
//! Each client runs one collector task per link. It wakes on a periodic
//! timer, on the registry's kick (fired when a proxy handle is dropped)
//! and after every N intercepted calls, sweeps the registry for proxies
//! this process has released, and reports them to the owning peer in one
//! `GcCleanup` frame per sweep. The protocol assumes no particular
//! cadence; these triggers are local tuning.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::CallChannel;

/// Collector tuning knobs.
#[derive(Debug, Clone)]
pub struct GcConfig {
	/// Periodic sweep interval.
	pub interval: Duration,
}

impl Default for GcConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(20),
		}
	}
}

/// Spawns the collector task for one link.
pub(crate) fn spawn_collector(
	channel: CallChannel,
	config: GcConfig,
	stop: CancellationToken,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let registry = channel.registry().clone();
		let kick = registry.gc_kick();
		let mut interval = tokio::time::interval(config.interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		// The first tick completes immediately; consume it.
		interval.tick().await;
		loop {
			tokio::select! {
				() = stop.cancelled() => break,
				_ = interval.tick() => {}
				() = kick.notified() => {}
			}
			let swept = registry.sweep_released(channel.peer(), false);
			if swept.is_empty() {
				continue;
			}
			tracing::debug!(peer = %channel.peer(), count = swept.len(), "reporting released proxies");
			if channel.send_gc_cleanup(&swept).await.is_err() {
				break;
			}
		}
	})
}
