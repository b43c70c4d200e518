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
//! Full sorter: buffer everything, sort once, emit windows.
//!
//! Input chunks are buffered untouched next to their encoded sort keys.
//! `done` orders a permutation of (chunk, row) addresses instead of moving
//! data; `get_next` materializes one output window at a time, so peak memory
//! stays near the input size plus one output chunk.

use std::mem::size_of;
use std::sync::Arc;

use crate::chunksort_logging::debug;
use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;
use crate::exec::sort::data_segment::DataSegment;
use crate::exec::sort::permutation::{Permutation, PermutationItem, materialize_by_permutation};
use crate::exec::sort::{ChunksSorter, SortExpr, SorterPhase, SorterShared, sort_permutation};
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};
use crate::runtime::profile::RuntimeProfile;
use crate::runtime::runtime_state::RuntimeState;

pub struct ChunksSorterFullSort {
    shared: SorterShared,
    segments: Vec<DataSegment>,
    /// Input chunks in arrival order, populated when `done` retires the
    /// segments and their key encodings.
    chunks: Vec<Chunk>,
    chunks_bytes: i64,
    permutation: Permutation,
    permutation_bytes: Option<TrackedBytes>,
    phase: SorterPhase,
}

impl ChunksSorterFullSort {
    pub fn new(sort_exprs: Vec<SortExpr>) -> Result<Self> {
        if sort_exprs.is_empty() {
            return Err(Error::InvalidConfiguration(
                "full sorter requires at least one sort key".to_string(),
            ));
        }
        Ok(Self {
            shared: SorterShared::new("FullSorter", sort_exprs),
            segments: Vec::new(),
            chunks: Vec::new(),
            chunks_bytes: 0,
            permutation: Vec::new(),
            permutation_bytes: None,
            phase: SorterPhase::Consuming,
        })
    }

    fn guard(&self, state: &RuntimeState) -> Result<()> {
        if let SorterPhase::Failed(err) = &self.phase {
            return Err(err.clone());
        }
        state.check_canceled()
    }

    fn fail<T>(&mut self, state: &RuntimeState, err: Error) -> Result<T> {
        state.set_error(err.clone());
        self.phase = SorterPhase::Failed(err.clone());
        Err(err)
    }

    fn update_inner(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let _t = self.shared.build_scope();
        if chunk.is_empty() {
            return Ok(());
        }
        self.shared.ensure_converter(&chunk)?;
        let converter = self.shared.converter()?;
        let segment = DataSegment::new(&self.shared.sort_exprs, converter, chunk)?;
        self.chunks_bytes += segment.memory_usage();
        self.segments.push(segment);
        self.shared.consume_and_check_memory(state, self.chunks_bytes)
    }

    fn done_inner(&mut self, state: &RuntimeState) -> Result<()> {
        let _t = self.shared.sort_scope();

        let total_rows: usize = self.segments.iter().map(|s| s.chunk.len()).sum();
        if total_rows > 0 {
            // Account the permutation buffer before allocating it.
            let bytes = total_rows * size_of::<PermutationItem>();
            if let Some(tracker) = self.shared.tracker(state) {
                self.permutation_bytes = Some(TrackedBytes::try_new(bytes, tracker)?);
            }

            let mut permutation: Permutation = Vec::with_capacity(total_rows);
            for (chunk_index, segment) in self.segments.iter().enumerate() {
                for index_in_chunk in 0..segment.chunk.len() {
                    permutation.push(PermutationItem {
                        chunk_index: chunk_index as u32,
                        index_in_chunk: index_in_chunk as u32,
                    });
                }
            }
            sort_permutation(&self.segments, &mut permutation);
            self.permutation = permutation;
        }

        // The key encodings are only needed for ordering; keep the chunks
        // and give the encoding bytes back.
        self.chunks = self.segments.drain(..).map(|s| s.chunk).collect();
        self.chunks_bytes = self
            .chunks
            .iter()
            .map(|c| c.estimated_bytes() as i64)
            .sum();
        debug!(
            "FullSorter done: chunks={} rows={}",
            self.chunks.len(),
            self.permutation.len()
        );
        self.shared.consume_and_check_memory(state, self.chunks_bytes)
    }

    fn get_next_inner(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        let _t = self.shared.output_scope();
        let total = self.permutation.len();
        if self.shared.next_output_row >= total {
            return Ok(None);
        }
        let end = (self.shared.next_output_row + state.chunk_size()).min(total);
        let items = &self.permutation[self.shared.next_output_row..end];
        let chunk = materialize_by_permutation(&self.chunks, items)?;
        self.shared.next_output_row = end;
        Ok(Some(chunk))
    }
}

impl ChunksSorter for ChunksSorterFullSort {
    fn setup_runtime(&mut self, parent_profile: &RuntimeProfile, parent_mem_tracker: &Arc<MemTracker>) {
        self.shared.setup_runtime(parent_profile, parent_mem_tracker);
    }

    fn update(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        self.guard(state)?;
        if !matches!(self.phase, SorterPhase::Consuming) {
            return self.fail(
                state,
                Error::InvalidConfiguration("update called after done".to_string()),
            );
        }
        match self.update_inner(state, chunk) {
            Ok(()) => Ok(()),
            Err(err) => self.fail(state, err),
        }
    }

    fn done(&mut self, state: &RuntimeState) -> Result<()> {
        self.guard(state)?;
        if !matches!(self.phase, SorterPhase::Consuming) {
            return self.fail(
                state,
                Error::InvalidConfiguration("done called twice".to_string()),
            );
        }
        match self.done_inner(state) {
            Ok(()) => {
                self.phase = SorterPhase::Producing;
                Ok(())
            }
            Err(err) => self.fail(state, err),
        }
    }

    fn get_next(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        self.guard(state)?;
        if !matches!(self.phase, SorterPhase::Producing) {
            return self.fail(
                state,
                Error::InvalidConfiguration("get_next called before done".to_string()),
            );
        }
        match self.get_next_inner(state) {
            Ok(v) => Ok(v),
            Err(err) => self.fail(state, err),
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

    fn chunk(keys: Vec<Option<i32>>, names: Vec<Option<&str>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("k", DataType::Int32, true), SlotId::new(0)),
            field_with_slot_id(Field::new("n", DataType::Utf8, true), SlotId::new(1)),
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

    fn collect_keys(chunk: &Chunk) -> Vec<Option<i32>> {
        let col = chunk
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("int32");
        (0..col.len())
            .map(|i| (!col.is_null(i)).then(|| col.value(i)))
            .collect()
    }

    fn collect_names(chunk: &Chunk) -> Vec<Option<String>> {
        let col = chunk
            .batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        (0..col.len())
            .map(|i| (!col.is_null(i)).then(|| col.value(i).to_string()))
            .collect()
    }

    fn drain(sorter: &mut ChunksSorterFullSort, state: &RuntimeState) -> Vec<Chunk> {
        let mut out = Vec::new();
        while let Some(chunk) = sorter.get_next(state).expect("get_next") {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn sorts_rows_across_chunks_with_nulls_first() {
        let state = RuntimeState::default();
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            true,
            true,
        )])
        .expect("sorter");

        sorter
            .update(&state, chunk(vec![Some(5), None, Some(1)], vec![Some("a"), Some("b"), Some("c")]))
            .expect("update");
        sorter
            .update(&state, chunk(vec![Some(3), Some(2)], vec![None, Some("e")]))
            .expect("update");
        sorter.done(&state).expect("done");

        let out = drain(&mut sorter, &state);
        assert_eq!(out.len(), 1);
        assert_eq!(
            collect_keys(&out[0]),
            vec![None, Some(1), Some(2), Some(3), Some(5)]
        );
        assert_eq!(
            collect_names(&out[0]),
            vec![
                Some("b".to_string()),
                Some("c".to_string()),
                Some("e".to_string()),
                None,
                Some("a".to_string()),
            ]
        );
    }

    #[test]
    fn descending_with_nulls_last_puts_nulls_at_the_end() {
        let state = RuntimeState::default();
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            false,
            false,
        )])
        .expect("sorter");

        sorter
            .update(&state, chunk(vec![Some(5), None, Some(1)], vec![Some("a"), Some("b"), Some("c")]))
            .expect("update");
        sorter
            .update(&state, chunk(vec![None, Some(2)], vec![Some("d"), Some("e")]))
            .expect("update");
        sorter.done(&state).expect("done");

        let out = drain(&mut sorter, &state);
        assert_eq!(out.len(), 1);
        assert_eq!(
            collect_keys(&out[0]),
            vec![Some(5), Some(2), Some(1), None, None]
        );
        // Tied null keys keep arrival order.
        assert_eq!(
            collect_names(&out[0]),
            vec![
                Some("a".to_string()),
                Some("e".to_string()),
                Some("c".to_string()),
                Some("b".to_string()),
                Some("d".to_string()),
            ]
        );
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let state = RuntimeState::default();
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            true,
            true,
        )])
        .expect("sorter");

        sorter
            .update(
                &state,
                chunk(vec![Some(7), Some(7)], vec![Some("first"), Some("second")]),
            )
            .expect("update");
        sorter
            .update(&state, chunk(vec![Some(7)], vec![Some("third")]))
            .expect("update");
        sorter.done(&state).expect("done");

        let out = drain(&mut sorter, &state);
        assert_eq!(out.len(), 1);
        assert_eq!(
            collect_names(&out[0]),
            vec![
                Some("first".to_string()),
                Some("second".to_string()),
                Some("third".to_string()),
            ]
        );
    }

    #[test]
    fn output_is_windowed_by_chunk_size() {
        let state = RuntimeState::new(
            Some(QueryOptions {
                batch_size: Some(4),
                ..Default::default()
            }),
            None,
        );
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            false,
            false,
        )])
        .expect("sorter");

        let keys = (0..10).map(Some).collect::<Vec<_>>();
        let names = (0..10).map(|_| Some("x")).collect::<Vec<_>>();
        sorter.update(&state, chunk(keys, names)).expect("update");
        sorter.done(&state).expect("done");

        let out = drain(&mut sorter, &state);
        assert_eq!(out.iter().map(Chunk::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        let all = out.iter().flat_map(collect_keys).collect::<Vec<_>>();
        assert_eq!(all, (0..10).rev().map(Some).collect::<Vec<_>>());
    }

    #[test]
    fn empty_input_produces_no_output() {
        let state = RuntimeState::default();
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            true,
            true,
        )])
        .expect("sorter");

        sorter
            .update(&state, chunk(Vec::new(), Vec::new()))
            .expect("empty chunk is fine");
        sorter.done(&state).expect("done");
        assert!(sorter.get_next(&state).expect("get_next").is_none());
    }

    #[test]
    fn get_next_before_done_is_rejected() {
        let state = RuntimeState::default();
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            true,
            true,
        )])
        .expect("sorter");

        let err = sorter.get_next(&state).expect_err("protocol misuse");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        // Protocol errors poison the sorter like any other failure.
        let err = sorter.done(&state).expect_err("poisoned");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn cancellation_surfaces_at_the_next_call() {
        let state = RuntimeState::default();
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            true,
            true,
        )])
        .expect("sorter");

        sorter
            .update(&state, chunk(vec![Some(1)], vec![Some("a")]))
            .expect("update");
        state.cancel();
        assert!(matches!(
            sorter.done(&state).expect_err("cancelled"),
            Error::Cancelled
        ));
    }

    #[test]
    fn memory_limit_failure_is_sticky() {
        let tracker = MemTracker::new_root_with_limit("query", 16);
        let state = RuntimeState::new(None, Some(tracker));
        let mut sorter = ChunksSorterFullSort::new(vec![SortExpr::by_slot(
            SlotId::new(0),
            true,
            true,
        )])
        .expect("sorter");

        let err = sorter
            .update(&state, chunk(vec![Some(1), Some(2)], vec![Some("a"), Some("b")]))
            .expect_err("over limit");
        assert!(matches!(err, Error::MemLimitExceeded { .. }));

        let err = sorter.done(&state).expect_err("sticky");
        assert!(matches!(err, Error::MemLimitExceeded { .. }));

        // The failure is also recorded as the session's first error.
        assert!(matches!(state.error(), Some(Error::MemLimitExceeded { .. })));
    }

    #[test]
    fn rejects_empty_sort_keys() {
        assert!(matches!(
            ChunksSorterFullSort::new(Vec::new()),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
