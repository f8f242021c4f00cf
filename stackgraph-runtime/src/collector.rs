//! Process-wide recording surface.
//!
//! One [`Registry`] per process, created on first use (or by [`init`]). Each
//! thread lazily gets its own [`ThreadStorage`] in a thread-local, so
//! [`enter`] and guard drop take no lock once the thread has seen a label.
//! A thread's graph is folded into the registry when it calls [`flush`], when
//! an [`AdoptGuard`] drops, and when the thread exits.
//!
//! Guards are `Send`. A guard dropped on a different thread than the one that
//! created it cannot reach the original thread's storage, so that scope's
//! measurement is discarded.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use serde::Serialize;
use stackgraph::{Frame, GraphData, MasterCursor, Registry, Settings, ThreadStorage};
use tracing::{debug, warn};

use crate::{CallCount, CpuClock, WallClock};

/// What every recorded scope carries.
pub type Measurements = (WallClock, CpuClock, CallCount);

static REGISTRY: OnceLock<Arc<Registry<Measurements>>> = OnceLock::new();

fn registry() -> &'static Arc<Registry<Measurements>> {
    REGISTRY.get_or_init(|| Arc::new(Registry::new(Settings::from_env())))
}

thread_local! {
    static STORAGE: RefCell<Option<ThreadStorage<Measurements>>> = const { RefCell::new(None) };
}

/// Run `f` on this thread's storage, creating it on first use.
///
/// Returns `None` while the thread-local is being torn down or when called
/// re-entrantly.
fn with_storage<R>(f: impl FnOnce(&mut ThreadStorage<Measurements>) -> R) -> Option<R> {
    STORAGE
        .try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            let storage = slot.get_or_insert_with(|| ThreadStorage::new(Arc::clone(registry())));
            Some(f(storage))
        })
        .ok()
        .flatten()
}

/// Configure the process registry. The first call wins; later calls (and any
/// call after recording has started) return `false` and change nothing.
pub fn init(settings: Settings) -> bool {
    let mut installed = false;
    REGISTRY.get_or_init(|| {
        installed = true;
        Arc::new(Registry::new(settings))
    });
    if !installed {
        debug!("runtime already initialized, settings ignored");
    }
    installed
}

/// RAII scope guard. Stops the scope's measurements on drop.
#[must_use = "dropping the guard immediately records an empty scope; bind it with `let _guard = ...`"]
pub struct Guard {
    frame: Option<Frame<Measurements>>,
    thread: ThreadId,
}

const _: () = {
    fn _assert_send<T: Send>() {}
    fn _check() {
        _assert_send::<Guard>();
    }
};

impl Drop for Guard {
    fn drop(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        if std::thread::current().id() != self.thread {
            debug!("guard dropped on another thread, scope discarded");
            return;
        }
        with_storage(|storage| storage.exit(frame));
    }
}

/// Open the scope `label` under the current one.
pub fn enter(label: &str) -> Guard {
    let frame = with_storage(|storage| storage.enter_label(label)).and_then(|res| match res {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(%label, error = %err, "failed to enter scope");
            None
        }
    });
    Guard {
        frame,
        thread: std::thread::current().id(),
    }
}

/// Handle on a thread's open scope, passed to worker threads via [`adopt`].
#[derive(Debug, Clone, Copy)]
pub struct SpanContext {
    cursor: MasterCursor,
}

/// Capture the open scope for worker threads.
///
/// Returns `None` when no scope is open on this thread.
pub fn fork() -> Option<SpanContext> {
    with_storage(|storage| {
        let data = storage.data();
        if data.current() == data.head() {
            return None;
        }
        storage.fork()
    })
    .flatten()
    .map(|cursor| SpanContext { cursor })
}

/// Ends an adoption on drop and merges the adopted work.
#[must_use = "dropping AdoptGuard immediately ends the adoption; bind it with `let _guard = ...`"]
pub struct AdoptGuard {
    active: bool,
}

impl Drop for AdoptGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        with_storage(|storage| {
            storage.detach();
            if let Err(err) = storage.finalize() {
                warn!(error = %err, "failed to merge adopted scopes");
            }
        });
    }
}

/// Record this thread's scopes below the scope captured by [`fork`].
pub fn adopt(ctx: &SpanContext) -> AdoptGuard {
    let active = with_storage(|storage| storage.adopt(ctx.cursor)).is_some_and(|res| match res {
        Ok(anchor) => anchor.is_some(),
        Err(err) => {
            warn!(error = %err, "failed to adopt span context");
            false
        }
    });
    AdoptGuard { active }
}

/// Merge the calling thread's scopes into the process registry.
pub fn flush() {
    let Some(result) = with_storage(|storage| storage.finalize()) else {
        return;
    };
    match result {
        Ok(report) => debug!(merged = report.merged, grafted = report.grafted, "flushed thread"),
        Err(err) => warn!(error = %err, "failed to flush thread"),
    }
}

/// Flush the calling thread and return everything merged so far.
///
/// Other threads contribute once they flush, finish an adoption or exit.
pub fn collect_all() -> GraphData<Measurements> {
    flush();
    registry().finalize()
}

/// One scope of the merged graph, flattened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeRecord {
    pub label: String,
    pub depth: u32,
    pub calls: u64,
    pub wall_ns: u64,
    pub cpu_ns: u64,
}

/// Every recorded scope in pre-order, parents before children.
pub fn records() -> Vec<ScopeRecord> {
    let graph = collect_all();
    let registry = registry();
    graph
        .pre_order()
        .filter(|(_, node)| !node.is_dummy())
        .map(|(_, node)| {
            let (wall, cpu, count) = node.bundle();
            ScopeRecord {
                label: registry
                    .label(node.id())
                    .unwrap_or_else(|| format!("{:#018x}", node.id().0)),
                depth: node.depth(),
                calls: count.calls,
                wall_ns: wall.total_ns,
                cpu_ns: cpu.total_ns,
            }
        })
        .collect()
}

/// Discard the calling thread's scopes and everything merged so far.
pub fn reset() {
    with_storage(|storage| storage.reset());
    registry().reset();
}

/// Flush the calling thread and return the final records.
pub fn shutdown() -> Vec<ScopeRecord> {
    let records = records();
    debug!(scopes = records.len(), "runtime shut down");
    records
}
