//! Call-graph storage for heterogeneous performance measurements.
//!
//! Measurements are [`Component`]s grouped into tuples ([`Bundle`]s) and
//! driven through the compile-time dispatch in [`dispatch`]. Each thread
//! records nested scope entries into its own [`GraphData`], a tree of
//! bundles addressed by scope identity and call path. At join points the
//! per-thread graphs are folded into a shared [`Registry`] by [`merge`], and
//! optionally across ranks by [`dist::reduce`].
//!
//! ```
//! use std::sync::Arc;
//! use stackgraph::{Laps, Registry, Settings, ThreadStorage};
//!
//! let registry = Arc::new(Registry::<(Laps,)>::new(Settings::default()));
//! let mut thread = ThreadStorage::new(Arc::clone(&registry));
//!
//! let outer = thread.enter_label("outer")?;
//! let inner = thread.enter_label("inner")?;
//! thread.exit(inner);
//! thread.exit(outer);
//! thread.finalize()?;
//!
//! let merged = registry.finalize();
//! assert_eq!(merged.aggregate().0.count(), 2);
//! # Ok::<(), stackgraph::Error>(())
//! ```

pub mod component;
pub mod dispatch;
pub mod dist;
pub mod error;
pub mod graph;
pub mod merge;
pub mod settings;
pub mod storage;
pub mod tree;

#[cfg(test)]
mod testing;

pub use component::{BackendError, BackendFailures, Category, Component, Laps};
pub use dispatch::{Bundle, Select};
pub use error::{Error, Result};
pub use graph::{GraphData, MasterCursor, Node, NodeKey, ScopeId};
pub use merge::{merge, MergeReport};
pub use settings::{ScopeMode, Settings};
pub use storage::{Frame, Registry, ThreadStorage};
pub use tree::{NodeId, Tree};
