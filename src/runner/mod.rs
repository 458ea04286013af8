//! Job handlers (spec §4.5, §4.6): one per queue name. Each is a plain
//! async function over a claimed `QueuedJob`'s payload, grounded in the
//! teacher's `tasks::handlers` dispatch style generalized from an in-process
//! task table to the durable `queue::Queue`.

pub mod execution_runner;
pub mod session_runner;
