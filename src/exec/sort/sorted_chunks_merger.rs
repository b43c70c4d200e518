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
//! K-way merge of sorted chunk streams.
//!
//! One cursor per supplier tracks the current chunk and row; a min-heap
//! over the cursor head rows yields the next row in output order. An
//! exhausted cursor pulls its supplier for the next chunk and retires for
//! good once the supplier returns `None`. When a single source remains its
//! chunks pass through without any comparison.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use arrow::row::{Row, RowConverter};

use crate::chunksort_logging::debug;
use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;
use crate::exec::sort::data_segment::DataSegment;
use crate::exec::sort::permutation::{Permutation, PermutationItem, materialize_by_permutation};
use crate::exec::sort::{SortExpr, build_row_converter, eval_order_by_columns};
use crate::runtime::profile::{CounterRef, RuntimeProfile, ScopedTimer};
use crate::runtime::runtime_state::RuntimeState;

/// Pull-source of sorted chunks. `Ok(None)` marks the end of the stream and
/// is final; the merger never polls a supplier again after it.
pub type ChunkSupplier = Box<dyn FnMut() -> Result<Option<Chunk>> + Send>;

/// One supplier's read position: the current chunk with its encoded keys
/// and the next unconsumed row.
struct MergeCursor {
    source_index: usize,
    /// Distinguishes successive chunks of one source, so output assembly
    /// can tell whether two row references share a chunk.
    serial: u64,
    segment: DataSegment,
    offset: usize,
}

impl MergeCursor {
    fn current_row(&self) -> Row<'_> {
        self.segment.rows.row(self.offset)
    }
}

impl PartialEq for MergeCursor {
    fn eq(&self, other: &Self) -> bool {
        self.current_row() == other.current_row() && self.source_index == other.source_index
    }
}

impl Eq for MergeCursor {}

impl PartialOrd for MergeCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        // Head row in output order, then source index so tied rows drain
        // deterministically. Wrapped in `Reverse` on the heap.
        self.current_row()
            .cmp(&other.current_row())
            .then_with(|| self.source_index.cmp(&other.source_index))
    }
}

pub struct SortedChunksMerger {
    sort_exprs: Vec<SortExpr>,
    converter: Option<RowConverter>,
    suppliers: Vec<ChunkSupplier>,
    heap: BinaryHeap<Reverse<MergeCursor>>,
    /// Sole surviving source once the heap drains to one cursor; its
    /// chunks pass through unchanged.
    direct_source: Option<usize>,
    next_serial: u64,
    started: bool,
    finished: bool,
    failed: Option<Error>,
    profile: RuntimeProfile,
    merge_timer: CounterRef,
}

impl SortedChunksMerger {
    pub fn new(suppliers: Vec<ChunkSupplier>, sort_exprs: Vec<SortExpr>) -> Result<Self> {
        if suppliers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "merger requires at least one chunk supplier".to_string(),
            ));
        }
        if sort_exprs.is_empty() {
            return Err(Error::InvalidConfiguration(
                "merger requires at least one sort key".to_string(),
            ));
        }
        let profile = RuntimeProfile::new("SortedChunksMerger");
        let merge_timer = profile.add_timer("MergingTime");
        Ok(Self {
            sort_exprs,
            converter: None,
            suppliers,
            heap: BinaryHeap::new(),
            direct_source: None,
            next_serial: 0,
            started: false,
            finished: false,
            failed: None,
            profile,
            merge_timer,
        })
    }

    /// Attach this merger's profile to a parent.
    pub fn setup_runtime(&mut self, parent_profile: &RuntimeProfile) {
        parent_profile.add_child(self.profile.clone());
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    /// Pull the next merged chunk, `None` once every supplier is drained.
    /// Failures stick: after the first error every later call reports it
    /// again without touching the suppliers.
    pub fn get_next(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        state.check_canceled()?;
        match self.get_next_inner(state) {
            Ok(v) => Ok(v),
            Err(err) => {
                state.set_error(err.clone());
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    fn get_next_inner(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        let _t = ScopedTimer::new(Arc::clone(&self.merge_timer));
        if self.finished {
            return Ok(None);
        }
        if !self.started {
            self.start()?;
        }

        if let Some(source_index) = self.direct_source {
            let chunk = pull_non_empty(&mut self.suppliers[source_index])?;
            if chunk.is_none() {
                self.finished = true;
            }
            return Ok(chunk);
        }

        // The last source standing needs no comparisons; hand over its
        // buffered rows and switch to passthrough.
        if self.heap.len() == 1
            && let Some(Reverse(cursor)) = self.heap.pop()
        {
            self.direct_source = Some(cursor.source_index);
            let chunk = if cursor.offset == 0 {
                cursor.segment.chunk
            } else {
                let remaining = cursor.segment.chunk.len() - cursor.offset;
                cursor.segment.chunk.slice(cursor.offset, remaining)
            };
            return Ok(Some(chunk));
        }

        let merged = self.merge_rows(state)?;
        if merged.is_none() {
            self.finished = true;
        }
        Ok(merged)
    }

    /// Pull the first chunk of every supplier and seed the cursor heap.
    fn start(&mut self) -> Result<()> {
        self.started = true;
        if self.suppliers.len() == 1 {
            self.direct_source = Some(0);
            return Ok(());
        }
        for source_index in 0..self.suppliers.len() {
            let Some(chunk) = pull_non_empty(&mut self.suppliers[source_index])? else {
                continue;
            };
            if self.converter.is_none() {
                let key_columns = eval_order_by_columns(&self.sort_exprs, &chunk)?;
                self.converter = Some(build_row_converter(&self.sort_exprs, &key_columns)?);
            }
            let converter = self.converter()?;
            let segment = DataSegment::new(&self.sort_exprs, converter, chunk)?;
            self.push_cursor(source_index, segment);
        }
        debug!(
            "SortedChunksMerger started: suppliers={} live_sources={}",
            self.suppliers.len(),
            self.heap.len()
        );
        Ok(())
    }

    fn push_cursor(&mut self, source_index: usize, segment: DataSegment) {
        self.heap.push(Reverse(MergeCursor {
            source_index,
            serial: self.next_serial,
            segment,
            offset: 0,
        }));
        self.next_serial += 1;
    }

    fn merge_rows(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        let chunk_size = state.chunk_size();
        let mut pending_chunks: Vec<Chunk> = Vec::new();
        let mut rows: Permutation = Vec::new();
        // Chunk most recently referenced, so runs of rows from one cursor
        // share a single pending entry.
        let mut last_loaded: Option<(u64, u32)> = None;

        while rows.len() < chunk_size {
            let Some(Reverse(mut cursor)) = self.heap.pop() else {
                break;
            };
            let chunk_index = match last_loaded {
                Some((serial, index)) if serial == cursor.serial => index,
                _ => {
                    pending_chunks.push(cursor.segment.chunk.clone());
                    let index = (pending_chunks.len() - 1) as u32;
                    last_loaded = Some((cursor.serial, index));
                    index
                }
            };
            rows.push(PermutationItem {
                chunk_index,
                index_in_chunk: cursor.offset as u32,
            });
            cursor.offset += 1;
            if cursor.offset < cursor.segment.chunk.len() {
                self.heap.push(Reverse(cursor));
            } else if let Some(chunk) = pull_non_empty(&mut self.suppliers[cursor.source_index])? {
                let converter = self.converter()?;
                let segment = DataSegment::new(&self.sort_exprs, converter, chunk)?;
                self.push_cursor(cursor.source_index, segment);
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(materialize_by_permutation(&pending_chunks, &rows)?))
    }

    fn converter(&self) -> Result<&RowConverter> {
        self.converter
            .as_ref()
            .ok_or_else(|| Error::Internal("row converter not initialized".to_string()))
    }
}

/// Pull the next non-empty chunk, skipping empty ones. `Ok(None)` is final.
fn pull_non_empty(supplier: &mut ChunkSupplier) -> Result<Option<Chunk>> {
    loop {
        match supplier()? {
            Some(chunk) if chunk.is_empty() => continue,
            next => return Ok(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::runtime::runtime_state::QueryOptions;
    use arrow::array::{Array, Int32Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn chunk(keys: Vec<i32>, names: Vec<&str>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("k", DataType::Int32, false), SlotId::new(0)),
            field_with_slot_id(Field::new("n", DataType::Utf8, false), SlotId::new(1)),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(keys)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .expect("record batch");
        Chunk::new(batch)
    }

    fn keyed_chunk(keys: Vec<i32>) -> Chunk {
        let names = keys.iter().map(|_| "x").collect();
        chunk(keys, names)
    }

    fn collect_keys(chunk: &Chunk) -> Vec<i32> {
        let col = chunk
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("int32");
        col.values().to_vec()
    }

    fn collect_names(chunk: &Chunk) -> Vec<String> {
        let col = chunk
            .batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        (0..col.len()).map(|i| col.value(i).to_string()).collect()
    }

    fn supplier_from(chunks: Vec<Chunk>, calls: Arc<AtomicUsize>) -> ChunkSupplier {
        let mut remaining = chunks.into_iter();
        Box::new(move || {
            calls.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(remaining.next())
        })
    }

    fn asc_key() -> Vec<SortExpr> {
        vec![SortExpr::by_slot(SlotId::new(0), true, true)]
    }

    #[test]
    fn rejects_empty_suppliers_and_empty_keys() {
        assert!(matches!(
            SortedChunksMerger::new(Vec::new(), asc_key()),
            Err(Error::InvalidConfiguration(_))
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let supplier = supplier_from(vec![keyed_chunk(vec![1])], Arc::clone(&calls));
        assert!(matches!(
            SortedChunksMerger::new(vec![supplier], Vec::new()),
            Err(Error::InvalidConfiguration(_))
        ));
        // Validation happens before any supplier is touched.
        assert_eq!(calls.load(AtomicOrdering::Relaxed), 0);
    }

    #[test]
    fn single_supplier_passes_chunks_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        // Not sorted on purpose, passthrough does not reorder.
        let supplier = supplier_from(
            vec![keyed_chunk(vec![3, 1, 2]), keyed_chunk(vec![9, 8])],
            Arc::clone(&calls),
        );
        let mut merger = SortedChunksMerger::new(vec![supplier], asc_key()).expect("merger");

        let state = RuntimeState::default();
        let first = merger.get_next(&state).expect("get_next").expect("chunk");
        assert_eq!(collect_keys(&first), vec![3, 1, 2]);
        let second = merger.get_next(&state).expect("get_next").expect("chunk");
        assert_eq!(collect_keys(&second), vec![9, 8]);
        assert!(merger.get_next(&state).expect("get_next").is_none());

        // Drained suppliers stay retired.
        assert!(merger.get_next(&state).expect("get_next").is_none());
        assert_eq!(calls.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn merges_two_streams_with_refills() {
        let s1_calls = Arc::new(AtomicUsize::new(0));
        let s2_calls = Arc::new(AtomicUsize::new(0));
        let s1 = supplier_from(
            vec![keyed_chunk(vec![1, 4, 7]), keyed_chunk(vec![9])],
            Arc::clone(&s1_calls),
        );
        let s2 = supplier_from(vec![keyed_chunk(vec![2, 3, 8])], Arc::clone(&s2_calls));
        let mut merger = SortedChunksMerger::new(vec![s1, s2], asc_key()).expect("merger");

        let state = RuntimeState::default();
        let mut out = Vec::new();
        while let Some(chunk) = merger.get_next(&state).expect("get_next") {
            out.extend(collect_keys(&chunk));
        }
        assert_eq!(out, vec![1, 2, 3, 4, 7, 8, 9]);

        // Each supplier saw its chunks plus one final None, nothing after.
        let s1_total = s1_calls.load(AtomicOrdering::Relaxed);
        let s2_total = s2_calls.load(AtomicOrdering::Relaxed);
        assert_eq!(s1_total, 3);
        assert_eq!(s2_total, 2);
        assert!(merger.get_next(&state).expect("get_next").is_none());
        assert_eq!(s1_calls.load(AtomicOrdering::Relaxed), s1_total);
        assert_eq!(s2_calls.load(AtomicOrdering::Relaxed), s2_total);
    }

    #[test]
    fn tied_rows_drain_in_supplier_order() {
        let s1 = supplier_from(
            vec![chunk(vec![5, 5], vec!["a1", "a2"])],
            Arc::new(AtomicUsize::new(0)),
        );
        let s2 = supplier_from(
            vec![chunk(vec![5], vec!["b1"])],
            Arc::new(AtomicUsize::new(0)),
        );
        let mut merger = SortedChunksMerger::new(vec![s1, s2], asc_key()).expect("merger");

        let state = RuntimeState::default();
        let mut names = Vec::new();
        while let Some(chunk) = merger.get_next(&state).expect("get_next") {
            names.extend(collect_names(&chunk));
        }
        assert_eq!(names, vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn output_is_windowed_by_chunk_size() {
        let s1 = supplier_from(
            vec![keyed_chunk(vec![10, 20, 30, 40])],
            Arc::new(AtomicUsize::new(0)),
        );
        let s2 = supplier_from(vec![keyed_chunk(vec![15, 25])], Arc::new(AtomicUsize::new(0)));
        let mut merger = SortedChunksMerger::new(vec![s1, s2], asc_key()).expect("merger");

        let state = RuntimeState::new(
            Some(QueryOptions {
                batch_size: Some(3),
                ..Default::default()
            }),
            None,
        );
        let mut pages = Vec::new();
        while let Some(chunk) = merger.get_next(&state).expect("get_next") {
            pages.push(collect_keys(&chunk));
        }
        assert_eq!(pages, vec![vec![10, 15, 20], vec![25, 30, 40]]);
    }

    #[test]
    fn empty_supplier_chunks_are_skipped() {
        let s1 = supplier_from(
            vec![
                keyed_chunk(Vec::new()),
                keyed_chunk(vec![1, 6]),
                keyed_chunk(Vec::new()),
            ],
            Arc::new(AtomicUsize::new(0)),
        );
        let s2 = supplier_from(vec![keyed_chunk(vec![3])], Arc::new(AtomicUsize::new(0)));
        let mut merger = SortedChunksMerger::new(vec![s1, s2], asc_key()).expect("merger");

        let state = RuntimeState::default();
        let mut out = Vec::new();
        while let Some(chunk) = merger.get_next(&state).expect("get_next") {
            out.extend(collect_keys(&chunk));
        }
        assert_eq!(out, vec![1, 3, 6]);
    }

    #[test]
    fn supplier_failure_is_sticky_and_stops_polling() {
        let ok = supplier_from(vec![keyed_chunk(vec![1])], Arc::new(AtomicUsize::new(0)));
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let failing: ChunkSupplier = {
            let calls = Arc::clone(&failing_calls);
            Box::new(move || {
                calls.fetch_add(1, AtomicOrdering::Relaxed);
                Err(Error::Upstream("exchange closed".to_string()))
            })
        };
        let mut merger = SortedChunksMerger::new(vec![ok, failing], asc_key()).expect("merger");

        let state = RuntimeState::default();
        let err = merger.get_next(&state).expect_err("upstream failure");
        assert!(matches!(err, Error::Upstream(_)));

        let err = merger.get_next(&state).expect_err("sticky");
        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(failing_calls.load(AtomicOrdering::Relaxed), 1);
        assert!(matches!(state.error(), Some(Error::Upstream(_))));
    }

    #[test]
    fn cancellation_surfaces_before_any_pull() {
        let calls = Arc::new(AtomicUsize::new(0));
        let supplier = supplier_from(vec![keyed_chunk(vec![1])], Arc::clone(&calls));
        let mut merger = SortedChunksMerger::new(vec![supplier], asc_key()).expect("merger");

        let state = RuntimeState::default();
        state.cancel();
        assert!(matches!(
            merger.get_next(&state).expect_err("cancelled"),
            Error::Cancelled
        ));
        assert_eq!(calls.load(AtomicOrdering::Relaxed), 0);
    }

    #[test]
    fn all_suppliers_empty_is_end_of_stream() {
        let s1 = supplier_from(Vec::new(), Arc::new(AtomicUsize::new(0)));
        let s2 = supplier_from(Vec::new(), Arc::new(AtomicUsize::new(0)));
        let mut merger = SortedChunksMerger::new(vec![s1, s2], asc_key()).expect("merger");

        let state = RuntimeState::default();
        assert!(merger.get_next(&state).expect("get_next").is_none());
    }
}
