//! Where measurements live between scope entry and the final report.
//!
//! A [`Registry`] is shared by every thread of one measurement context. It
//! owns the label table and the merged graph, and serializes merges behind a
//! mutex. Each thread records into its own [`ThreadStorage`] without locking
//! and folds its graph into the registry at a join point: an explicit
//! [`ThreadStorage::finalize`], or drop when `merge_on_drop` is set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::component::BackendFailures;
use crate::dispatch::{self, Bundle};
use crate::error::Result;
use crate::graph::{GraphData, MasterCursor, Node, ScopeId};
use crate::merge::{self, MergeReport};
use crate::settings::{ScopeMode, Settings};
use crate::tree::NodeId;

pub struct Registry<B: Bundle> {
    settings: Settings,
    labels: Mutex<HashMap<ScopeId, String>>,
    global: Mutex<GraphData<B>>,
}

impl<B: Bundle> Registry<B> {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            labels: Mutex::new(HashMap::new()),
            global: Mutex::new(GraphData::rooted(0)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Id for `label`, remembering the label for reporting.
    pub fn register(&self, label: &str) -> ScopeId {
        let id = ScopeId::from_label(label);
        let mut labels = self.labels.lock().unwrap_or_else(|e| e.into_inner());
        match labels.get(&id) {
            Some(known) if known != label => {
                warn!(%label, known = %known, id = id.0, "scope id collision");
            }
            Some(_) => {}
            None => {
                labels.insert(id, label.to_owned());
            }
        }
        id
    }

    pub fn label(&self, id: ScopeId) -> Option<String> {
        self.labels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Fold `graph` into the merged graph.
    pub fn merge(&self, graph: &GraphData<B>) -> Result<MergeReport> {
        let mut global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        merge::merge(&mut global, graph)
    }

    /// Copy of everything merged so far.
    pub fn finalize(&self) -> GraphData<B> {
        let global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        debug!(nodes = global.len(), "registry finalized");
        global.clone()
    }

    /// Forget every merged measurement. Labels are kept.
    pub fn reset(&self) {
        self.global
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }
}

/// An open scope, returned by [`ThreadStorage::enter`] and consumed by
/// [`ThreadStorage::exit`].
#[must_use = "an entered scope must be passed back to `exit`"]
#[derive(Debug)]
pub struct Frame<B> {
    node: Option<NodeId>,
    pushed: bool,
    /// [`ThreadStorage::reset`] count when the frame was opened.
    epoch: u64,
    bundle: B,
}

impl<B> Frame<B> {
    /// Node the measurements will be folded into. `None` past the depth limit.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn bundle(&self) -> &B {
        &self.bundle
    }
}

static NEXT_ENTRY: AtomicU64 = AtomicU64::new(1);

/// Stamp for a timeline node, unique across every thread of the process.
fn next_entry() -> u64 {
    NEXT_ENTRY.fetch_add(1, Ordering::Relaxed)
}

pub struct ThreadStorage<B: Bundle> {
    registry: Arc<Registry<B>>,
    data: GraphData<B>,
    /// Entries past `max_depth` that have not exited yet.
    overflow: u32,
    /// Recorded frames that have not exited yet.
    open: u32,
    epoch: u64,
    /// Where to put the cursor back when an adoption ends.
    resume: Vec<NodeId>,
    /// Scope ids already in the registry's label table.
    seen: HashSet<ScopeId>,
    warned: Vec<&'static str>,
}

impl<B: Bundle> ThreadStorage<B> {
    pub fn new(registry: Arc<Registry<B>>) -> Self {
        Self {
            registry,
            data: GraphData::rooted(0),
            overflow: 0,
            open: 0,
            epoch: 0,
            resume: Vec::new(),
            seen: HashSet::new(),
            warned: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<B>> {
        &self.registry
    }

    pub fn data(&self) -> &GraphData<B> {
        &self.data
    }

    pub fn depth(&self) -> u32 {
        self.data.depth()
    }

    pub fn overflow(&self) -> u32 {
        self.overflow
    }

    /// Scopes entered and recorded that have not exited yet.
    pub fn open(&self) -> u32 {
        self.open
    }

    /// Enter the scope of `label`. Only the first use of a label on this
    /// thread touches the registry's label table.
    pub fn enter_label(&mut self, label: &str) -> Result<Frame<B>> {
        let id = ScopeId::from_label(label);
        if self.seen.insert(id) {
            self.registry.register(label);
        }
        self.enter(id)
    }

    /// Place the scope in the graph and start a fresh bundle for it.
    pub fn enter(&mut self, id: ScopeId) -> Result<Frame<B>> {
        if self.overflow > 0 || self.data.depth() >= self.registry.settings.max_depth {
            if self.overflow == 0 {
                warn!(
                    max_depth = self.registry.settings.max_depth,
                    "max depth reached, deeper scopes are not recorded"
                );
            }
            self.overflow += 1;
            return Ok(Frame {
                node: None,
                pushed: false,
                epoch: self.epoch,
                bundle: B::default(),
            });
        }

        let (node, pushed) = self.place(id)?;
        self.open += 1;
        let mut bundle = B::default();
        if let Err(failures) = dispatch::start(&mut bundle) {
            self.report(failures);
        }
        Ok(Frame {
            node: Some(node),
            pushed,
            epoch: self.epoch,
            bundle,
        })
    }

    fn place(&mut self, id: ScopeId) -> Result<(NodeId, bool)> {
        match self.registry.settings.scope_mode {
            ScopeMode::Tree => {
                let depth = self.data.depth() + 1;
                let existing = self.data.current().and_then(|cur| {
                    self.data
                        .tree()
                        .children(cur)
                        .find(|(_, n)| !n.is_dummy() && n.id() == id && n.depth() == depth)
                        .map(|(child, _)| child)
                });
                let node = match existing {
                    Some(child) => self.data.descend(child)?,
                    None => self.data.append_child(Node::new(id, depth, B::default()))?,
                };
                Ok((node, true))
            }
            ScopeMode::Timeline => {
                let depth = self.data.depth() + 1;
                let node = self
                    .data
                    .append_child(Node::single(id, depth, next_entry(), B::default()))?;
                Ok((node, true))
            }
            ScopeMode::Flat => {
                let head = self.data.head().ok_or(crate::Error::Unrooted)?;
                let depth = self.data.get(head).map_or(0, |n| n.depth()) + 1;
                let existing = self
                    .data
                    .tree()
                    .children(head)
                    .find(|(_, n)| !n.is_dummy() && n.id() == id)
                    .map(|(child, _)| child);
                let node = match existing {
                    Some(child) => child,
                    None => self.data.append_head(Node::new(id, depth, B::default()))?,
                };
                Ok((node, false))
            }
        }
    }

    /// Stop the frame's bundle, fold it into its node and close the scope.
    pub fn exit(&mut self, mut frame: Frame<B>) {
        let Some(node) = frame.node else {
            self.overflow = self.overflow.saturating_sub(1);
            return;
        };
        if let Err(failures) = dispatch::stop(&mut frame.bundle) {
            self.report(failures);
        }
        if frame.epoch != self.epoch {
            trace!("scope opened before a reset, measurement discarded");
            return;
        }
        self.open = self.open.saturating_sub(1);
        if let Some(target) = self.data.get_mut(node) {
            dispatch::plus(target.bundle_mut(), &frame.bundle);
        }
        if frame.pushed {
            self.data.pop_graph();
        }
    }

    /// Snapshot of the open scope for [`ThreadStorage::adopt`] on another thread.
    pub fn fork(&self) -> Option<MasterCursor> {
        self.data.fork()
    }

    /// Continue recording below `cursor`, the open scope of another thread.
    /// Scopes this thread already has open resume on [`ThreadStorage::detach`].
    pub fn adopt(&mut self, cursor: MasterCursor) -> Result<Option<NodeId>> {
        let resume = self.data.current();
        self.data.set_master(cursor);
        let dummy = self.data.add_dummy()?;
        if let (Some(_), Some(at)) = (dummy, resume) {
            self.resume.push(at);
        }
        Ok(dummy)
    }

    /// End an adoption: the cursor goes back to where it was before
    /// [`ThreadStorage::adopt`], or to the head if that node is gone.
    pub fn detach(&mut self) {
        let restored = self
            .resume
            .pop()
            .is_some_and(|at| self.data.seek(at).is_ok());
        if !restored {
            self.data.rewind();
        }
    }

    /// Merge this thread's graph into the registry and start over.
    ///
    /// With scopes still open, or during an adoption, the shape is kept and
    /// only the values are zeroed, so those scopes can still exit into their
    /// nodes.
    pub fn finalize(&mut self) -> Result<MergeReport> {
        let report = self.registry.merge(&self.data)?;
        if self.open == 0 && self.data.current() == self.data.head() {
            self.data.reset();
        } else {
            self.data.clear_values();
        }
        Ok(report)
    }

    /// Drop everything recorded on this thread without merging it. Scopes
    /// still open are discarded when they exit.
    pub fn reset(&mut self) {
        self.data.reset();
        self.overflow = 0;
        self.open = 0;
        self.epoch += 1;
        self.resume.clear();
    }

    fn report(&mut self, failures: BackendFailures) {
        for err in failures {
            let label = err.label();
            if !self.warned.contains(&label) {
                warn!(component = label, error = %err, "measurement backend failed, continuing without it");
                self.warned.push(label);
            }
        }
    }
}

impl<B: Bundle> Drop for ThreadStorage<B> {
    fn drop(&mut self) {
        if !self.registry.settings.merge_on_drop || self.data.len() <= 1 {
            return;
        }
        if let Err(err) = self.finalize() {
            warn!(error = %err, "failed to merge thread graph on exit");
        }
    }
}
