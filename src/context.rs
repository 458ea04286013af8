//! Shared worker context threaded into every job handler. Bundles the
//! pieces `main.rs` wires up once at startup (spec §6.5 pre-flight) so
//! `runner::session_runner`/`runner::execution_runner` don't each take five
//! separate arguments.

use crate::config::WorkerConfig;
use crate::notify::NotifyBus;
use crate::queue::Queue;
use crate::registry::CapabilityRegistry;
use crate::storage::Storage;
use std::sync::Arc;

#[derive(Clone)]
pub struct WorkerContext {
    pub storage: Storage,
    pub notify: NotifyBus,
    pub queue: Queue,
    pub registry: CapabilityRegistry,
    pub config: Arc<WorkerConfig>,
}
