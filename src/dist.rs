//! Reduction of per-process graphs across ranks.
//!
//! A [`Transport`] moves whole graphs to rank 0, which folds them together
//! with the same resolver used between threads. Without a real transport
//! [`SingleRank`] makes the reduction a no-op.

use std::any::Any;
use std::sync::{Arc, Barrier, Mutex};

use tracing::debug;

use crate::dispatch::Bundle;
use crate::error::{Error, Result};
use crate::graph::GraphData;
use crate::merge;

pub trait Transport {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Block until every rank has reached this point.
    fn barrier(&self) -> Result<()>;

    /// Collective: every rank contributes `graph`. Rank 0 receives all of them
    /// in rank order; other ranks receive `None`.
    fn gather<B: Bundle>(&self, graph: GraphData<B>) -> Result<Option<Vec<GraphData<B>>>>;
}

/// The only rank there is.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRank;

impl Transport for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn gather<B: Bundle>(&self, graph: GraphData<B>) -> Result<Option<Vec<GraphData<B>>>> {
        Ok(Some(vec![graph]))
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

/// In-process group of ranks, one handle per participating thread.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Handles for ranks `0..size`. Each must be driven by its own thread.
    pub fn new(size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size.max(1)),
            slots: Mutex::new((0..size).map(|_| None).collect()),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Transport for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn gather<B: Bundle>(&self, graph: GraphData<B>) -> Result<Option<Vec<GraphData<B>>>> {
        {
            let payload: Box<dyn Any + Send> = Box::new(graph);
            let mut slots = self.shared.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots[self.rank] = Some(payload);
        }
        self.barrier()?;

        let gathered = if self.rank == 0 {
            let mut slots = self.shared.slots.lock().unwrap_or_else(|e| e.into_inner());
            let drained: Vec<_> = slots.iter_mut().map(Option::take).collect();
            drop(slots);
            drained
                .into_iter()
                .enumerate()
                .map(|(rank, slot)| {
                    let payload = slot
                        .ok_or_else(|| Error::Transport(format!("rank {rank} sent nothing")))?;
                    payload.downcast::<GraphData<B>>().map(|graph| *graph).map_err(|_| {
                        Error::Transport(format!("rank {rank} sent a graph of another bundle type"))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Some)
        } else {
            Ok(None)
        };

        // Every rank waits here, even when rank 0 failed, so no rank is left
        // blocked at the barrier.
        self.barrier()?;
        gathered
    }
}

/// Fold every rank's graph into one at rank 0.
///
/// Rank 0 gets `Some(merged)`; other ranks get `None`. A group of one returns
/// `local` untouched.
pub fn reduce<T: Transport, B: Bundle>(
    transport: &T,
    local: GraphData<B>,
) -> Result<Option<GraphData<B>>> {
    if transport.size() <= 1 {
        return Ok(Some(local));
    }
    let Some(graphs) = transport.gather(local)? else {
        return Ok(None);
    };

    let mut graphs = graphs.into_iter();
    let Some(mut merged) = graphs.next() else {
        return Err(Error::Transport("gather returned no graphs".into()));
    };
    for (rank, graph) in graphs.enumerate() {
        let report = merge::merge(&mut merged, &graph)?;
        debug!(
            rank = rank + 1,
            merged = report.merged,
            grafted = report.grafted,
            "reduced rank graph"
        );
    }
    Ok(Some(merged))
}
