use std::sync::atomic::Ordering;

use serde_json::{json, Value as Json};
use sysinfo::{Pid, System};

use super::ApiState;
use crate::error::DbResult;

/// `stats` target: process snapshot of connection count, memory usage,
/// alive task count and in-flight query count.
pub fn handle(state: &ApiState) -> DbResult<Json> {
    let pid = Pid::from_u32(std::process::id());
    let system = System::new_all();
    let (memory, virtual_memory) = system
        .process(pid)
        .map(|p| (p.memory(), p.virtual_memory()))
        .unwrap_or((0, 0));

    let tasks = tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .unwrap_or(0);

    Ok(json!({
        "connections": state.connections.load(Ordering::Relaxed),
        "memory": {
            "resident": memory,
            "virtual": virtual_memory,
        },
        "queries": state.active_queries.load(Ordering::Relaxed),
        "tasks": tasks,
    }))
}
