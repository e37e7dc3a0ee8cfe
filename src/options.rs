//! Driver options

/// Dispatch backend for a driver invocation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Host task graph, one kernel per tile task (default)
    HostTask,
    /// Host task graph with nested parallel loops inside internal ops
    HostNest,
    /// Host task graph with batched (shape-grouped) kernel calls
    HostBatch,
    /// Batched kernels on accelerator devices (host-staged when no
    /// accelerator backend is present)
    Devices,
}

/// Options accepted by every driver
#[derive(Clone, Debug)]
pub struct Options {
    /// Dispatch backend
    pub target: Target,
    /// Panels overlapped with trailing updates (`L >= 0`)
    pub lookahead: i64,
    /// Panel inner blocking
    pub inner_blocking: i64,
    /// Threads for the nested panel region
    pub max_panel_threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        let avail = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            target: Target::HostTask,
            lookahead: 1,
            inner_blocking: 16,
            max_panel_threads: (avail / 2).max(1),
        }
    }
}

impl Options {
    /// Options with an explicit lookahead depth
    pub fn with_lookahead(lookahead: i64) -> Self {
        Self {
            lookahead,
            ..Self::default()
        }
    }

    /// Options with an explicit target
    pub fn with_target(target: Target) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }
}
