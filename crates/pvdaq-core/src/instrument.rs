//! Instrument strategy seam.
//!
//! The engine is instrument-agnostic: everything firmware-specific (command
//! vocabulary, configure sequence, synchronization table, timer policy)
//! lives behind this trait. Tracker, relay, light, and heat controllers each
//! implement it against the same engine core; only the tracker strategy
//! ships in this workspace.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::Command;
use crate::engine::Engine;
use crate::scheduler::ChannelId;
use crate::status::{ChannelStatus, SyncEntry};

#[async_trait]
pub trait Instrument: Send + Sync {
    /// Instrument kind tag, e.g. "tracker".
    fn kind(&self) -> &'static str;

    /// Ordered table of hardware configuration commands and their value
    /// selectors, applied by the engine's synchronization routine.
    fn sync_table(&self) -> &'static [SyncEntry];

    /// Global pause command sent before a synchronization batch.
    fn pause_command(&self) -> Command;

    /// Global resume command sent after a synchronization batch.
    fn resume_command(&self) -> Command;

    /// One-time setup sequence, re-run after every connection reset.
    async fn configure(&self, engine: &Arc<Engine>) -> anyhow::Result<()>;

    /// Hook invoked after a channel's record was synchronized to hardware.
    /// Implementations re-arm their timers here and may start an immediate
    /// acquisition (suppressed during the startup normalization pass).
    async fn on_status_applied(
        &self,
        engine: &Arc<Engine>,
        channel: ChannelId,
        current: &ChannelStatus,
        prev: Option<&ChannelStatus>,
        suppress_autostart: bool,
    ) -> anyhow::Result<()>;
}
