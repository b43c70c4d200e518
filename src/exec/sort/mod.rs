// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Sorter kernels and the sorted-stream merger.
//!
//! Responsibilities:
//! - Define the `update` / `done` / `get_next` lifecycle shared by the full
//!   sort and top-n sorters.
//! - Host the helpers both sorters and the merger share: order-by key
//!   evaluation, row-format converters and sort column assembly.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::SortOptions;
use arrow::row::{RowConverter, SortField};

use crate::common::config;
use crate::common::error::{Error, Result};
use crate::common::ids::SlotId;
use crate::exec::chunk::Chunk;
use crate::exec::expr::{SlotRef, SortKeyExpr};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterRef, RuntimeProfile, ScopedTimer};
use crate::runtime::runtime_state::RuntimeState;

pub mod chunks_sorter_full_sort;
pub mod chunks_sorter_topn;
mod data_segment;
mod permutation;
pub mod sorted_chunks_merger;

pub use chunks_sorter_full_sort::ChunksSorterFullSort;
pub use chunks_sorter_topn::ChunksSorterTopN;
pub use sorted_chunks_merger::{ChunkSupplier, SortedChunksMerger};

use data_segment::DataSegment;
use permutation::PermutationItem;

/// One ORDER BY key with its direction and null placement.
///
/// `nulls_first` refers to the output order, matching Arrow's convention.
#[derive(Clone, Debug)]
pub struct SortExpr {
    pub expr: Arc<dyn SortKeyExpr>,
    pub asc: bool,
    pub nulls_first: bool,
}

impl SortExpr {
    pub fn new(expr: Arc<dyn SortKeyExpr>, asc: bool, nulls_first: bool) -> Self {
        Self {
            expr,
            asc,
            nulls_first,
        }
    }

    /// Sort key over a plain column.
    pub fn by_slot(slot_id: SlotId, asc: bool, nulls_first: bool) -> Self {
        Self::new(Arc::new(SlotRef::new(slot_id)), asc, nulls_first)
    }

    pub fn sort_options(&self) -> SortOptions {
        SortOptions {
            descending: !self.asc,
            nulls_first: self.nulls_first,
        }
    }
}

/// Push/finalize/pull sorter abstraction.
///
/// The driving loop feeds chunks with `update`, seals the input with `done`
/// and then drains sorted output chunks with `get_next` until it returns
/// `None`. Implementations fail fast: the first error is recorded on the
/// session error state and every later call reports it again.
pub trait ChunksSorter: Send {
    /// Attach this sorter's profile and memory accounting to a parent.
    fn setup_runtime(&mut self, parent_profile: &RuntimeProfile, parent_mem_tracker: &Arc<MemTracker>);

    /// Absorb one input chunk.
    fn update(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()>;

    /// Seal the input. No `update` may follow.
    fn done(&mut self, state: &RuntimeState) -> Result<()>;

    /// Pull the next sorted output chunk, `None` once drained.
    fn get_next(&mut self, state: &RuntimeState) -> Result<Option<Chunk>>;
}

/// Lifecycle of a sorter instance.
///
/// Failures stick: after the first error every later call reports it again.
/// Cancellation is not recorded here, the session flag already persists.
pub(crate) enum SorterPhase {
    Consuming,
    Producing,
    Failed(Error),
}

/// State common to the sorter implementations: sort keys, phase timers and
/// the memory ledger reconciled against the sorter's current footprint.
pub(crate) struct SorterShared {
    pub(crate) sort_exprs: Vec<SortExpr>,
    /// Raw chunk count that triggers a partial sort-and-merge cycle in
    /// sorters that buffer input.
    pub(crate) size_of_chunk_batch: usize,
    /// Row cursor into the sorted result while draining output.
    pub(crate) next_output_row: usize,
    /// Built lazily from the first chunk's key columns and reused for every
    /// later encoding, so all rows order consistently.
    converter: Option<RowConverter>,
    profile: RuntimeProfile,
    build_timer: CounterRef,
    sort_timer: CounterRef,
    merge_timer: CounterRef,
    output_timer: CounterRef,
    mem_tracker: Option<Arc<MemTracker>>,
    last_memory_usage: i64,
}

impl SorterShared {
    pub(crate) fn new(name: &str, sort_exprs: Vec<SortExpr>) -> Self {
        let profile = RuntimeProfile::new(name);
        let build_timer = profile.add_timer("BuildingTime");
        let sort_timer = profile.add_timer("SortingTime");
        let merge_timer = profile.add_timer("MergingTime");
        let output_timer = profile.add_timer("OutputTime");
        Self {
            sort_exprs,
            size_of_chunk_batch: config::sorter_buffered_chunks(),
            next_output_row: 0,
            converter: None,
            profile,
            build_timer,
            sort_timer,
            merge_timer,
            output_timer,
            mem_tracker: None,
            last_memory_usage: 0,
        }
    }

    pub(crate) fn setup_runtime(
        &mut self,
        parent_profile: &RuntimeProfile,
        parent_mem_tracker: &Arc<MemTracker>,
    ) {
        parent_profile.add_child(self.profile.clone());
        self.mem_tracker = Some(MemTracker::new_child(self.profile.name(), parent_mem_tracker));
    }

    pub(crate) fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub(crate) fn ensure_converter(&mut self, chunk: &Chunk) -> Result<()> {
        if self.converter.is_none() {
            let key_columns = eval_order_by_columns(&self.sort_exprs, chunk)?;
            self.converter = Some(build_row_converter(&self.sort_exprs, &key_columns)?);
        }
        Ok(())
    }

    pub(crate) fn converter(&self) -> Result<&RowConverter> {
        self.converter
            .as_ref()
            .ok_or_else(|| Error::Internal("row converter not initialized".to_string()))
    }

    pub(crate) fn build_scope(&self) -> ScopedTimer {
        ScopedTimer::new(Arc::clone(&self.build_timer))
    }

    pub(crate) fn sort_scope(&self) -> ScopedTimer {
        ScopedTimer::new(Arc::clone(&self.sort_timer))
    }

    pub(crate) fn merge_scope(&self) -> ScopedTimer {
        ScopedTimer::new(Arc::clone(&self.merge_timer))
    }

    pub(crate) fn output_scope(&self) -> ScopedTimer {
        ScopedTimer::new(Arc::clone(&self.output_timer))
    }

    /// Tracker to account against. Falls back to the session tracker the
    /// first time one is needed and sticks with it from then on.
    fn tracker(&mut self, state: &RuntimeState) -> Option<Arc<MemTracker>> {
        if self.mem_tracker.is_none() {
            self.mem_tracker = state.mem_tracker();
        }
        self.mem_tracker.clone()
    }

    /// Reconcile the ledger with `current_bytes`, the sorter's present
    /// footprint. Growth goes through `try_consume` so session limits apply;
    /// shrinkage is released immediately. On failure the ledger keeps its
    /// previous value, which is what has actually been consumed.
    pub(crate) fn consume_and_check_memory(
        &mut self,
        state: &RuntimeState,
        current_bytes: i64,
    ) -> Result<()> {
        let Some(tracker) = self.tracker(state) else {
            self.last_memory_usage = current_bytes;
            return Ok(());
        };
        let delta = current_bytes - self.last_memory_usage;
        if delta > 0 {
            tracker.try_consume(delta)?;
        } else if delta < 0 {
            tracker.release(-delta);
        }
        self.last_memory_usage = current_bytes;
        Ok(())
    }
}

impl Drop for SorterShared {
    fn drop(&mut self) {
        if self.last_memory_usage > 0
            && let Some(tracker) = self.mem_tracker.as_ref()
        {
            tracker.release(self.last_memory_usage);
        }
    }
}

pub(crate) fn eval_order_by_columns(sort_exprs: &[SortExpr], chunk: &Chunk) -> Result<Vec<ArrayRef>> {
    let mut key_columns = Vec::with_capacity(sort_exprs.len());
    for sort_expr in sort_exprs {
        key_columns.push(sort_expr.expr.evaluate(chunk)?);
    }
    Ok(key_columns)
}

pub(crate) fn build_row_converter(
    sort_exprs: &[SortExpr],
    key_columns: &[ArrayRef],
) -> Result<RowConverter> {
    let fields = key_columns
        .iter()
        .zip(sort_exprs.iter())
        .map(|(col, expr)| SortField::new_with_options(col.data_type().clone(), expr.sort_options()))
        .collect::<Vec<_>>();
    Ok(RowConverter::new(fields)?)
}

/// Order a permutation by the segments' encoded keys. Ties fall back to the
/// row's (chunk, row) address, which is arrival order, so the overall sort
/// is stable.
pub(crate) fn sort_permutation(segments: &[DataSegment], permutation: &mut [PermutationItem]) {
    permutation.sort_unstable_by(|a, b| {
        segments[a.chunk_index as usize]
            .rows
            .row(a.index_in_chunk as usize)
            .cmp(&segments[b.chunk_index as usize].rows.row(b.index_in_chunk as usize))
            .then_with(|| (a.chunk_index, a.index_in_chunk).cmp(&(b.chunk_index, b.index_in_chunk)))
    });
}
