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
//! Top-n sorter: keep only the best `offset + limit` rows while consuming.
//!
//! Raw chunks accumulate until a threshold, then one sort-and-merge cycle
//! folds them into a single sorted segment of at most `offset + limit` rows.
//! Once that segment is full, later cycles classify new rows against its
//! boundary rows first, so most rows are cut after a handful of column
//! comparisons instead of a full sort.

use std::cmp::Ordering;
use std::mem::size_of;
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::row::RowConverter;

use crate::chunksort_logging::debug;
use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;
use crate::exec::sort::data_segment::{BEFORE_LAST_RESULT, DataSegment, IN_LAST_RESULT};
use crate::exec::sort::permutation::{Permutation, PermutationItem, materialize_by_permutation};
use crate::exec::sort::{ChunksSorter, SortExpr, SorterPhase, SorterShared, sort_permutation};
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};
use crate::runtime::profile::RuntimeProfile;
use crate::runtime::runtime_state::RuntimeState;

pub struct ChunksSorterTopN {
    shared: SorterShared,
    offset: usize,
    limit: usize,
    /// Unsorted input waiting for the next sort-and-merge cycle.
    raw_chunks: Vec<Chunk>,
    raw_bytes: i64,
    /// The best `offset + limit` rows seen so far, sorted.
    merged_segment: Option<DataSegment>,
    merged_bytes: i64,
    phase: SorterPhase,
}

impl ChunksSorterTopN {
    pub fn new(sort_exprs: Vec<SortExpr>, offset: usize, limit: usize) -> Result<Self> {
        if sort_exprs.is_empty() {
            return Err(Error::InvalidConfiguration(
                "top-n sorter requires at least one sort key".to_string(),
            ));
        }
        Ok(Self {
            shared: SorterShared::new("TopNSorter", sort_exprs),
            offset,
            limit,
            raw_chunks: Vec::new(),
            raw_bytes: 0,
            merged_segment: None,
            merged_bytes: 0,
            phase: SorterPhase::Consuming,
        })
    }

    fn rows_to_sort(&self) -> usize {
        self.offset.saturating_add(self.limit)
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

    /// Stash one input chunk, folding it into the previous one while the
    /// combined row count stays within a single output chunk. Many tiny
    /// chunks would otherwise each pay a full classification sweep.
    fn buffer_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        if let Some(last) = self.raw_chunks.last_mut()
            && last.len() + chunk.len() <= state.chunk_size()
        {
            self.raw_bytes -= last.estimated_bytes() as i64;
            let batch = concat_batches(&last.schema(), [&last.batch, &chunk.batch])?;
            *last = Chunk::try_new(batch)?;
            self.raw_bytes += last.estimated_bytes() as i64;
            return Ok(());
        }
        self.raw_bytes += chunk.estimated_bytes() as i64;
        self.raw_chunks.push(chunk);
        Ok(())
    }

    fn update_inner(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let _t = self.shared.build_scope();
        if self.limit == 0 || chunk.is_empty() {
            return Ok(());
        }
        self.buffer_chunk(state, chunk)?;
        // Charge the buffered bytes before a cycle truncates them; the
        // post-cycle charge shrinks the ledger back down.
        self.shared
            .consume_and_check_memory(state, self.raw_bytes + self.merged_bytes)?;
        if self.raw_chunks.len() >= self.shared.size_of_chunk_batch {
            self.sort_and_merge(state)?;
            self.shared
                .consume_and_check_memory(state, self.raw_bytes + self.merged_bytes)?;
        }
        Ok(())
    }

    fn done_inner(&mut self, state: &RuntimeState) -> Result<()> {
        self.shared
            .consume_and_check_memory(state, self.raw_bytes + self.merged_bytes)?;
        self.sort_and_merge(state)?;
        self.shared
            .consume_and_check_memory(state, self.raw_bytes + self.merged_bytes)?;
        self.shared.next_output_row = self.offset;
        Ok(())
    }

    fn get_next_inner(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        let _t = self.shared.output_scope();
        let Some(merged) = self.merged_segment.as_ref() else {
            return Ok(None);
        };
        let total = merged.chunk.len();
        if self.shared.next_output_row >= total {
            return Ok(None);
        }
        let start = self.shared.next_output_row;
        let length = (total - start).min(state.chunk_size());
        self.shared.next_output_row = start + length;
        Ok(Some(merged.chunk.slice(start, length)))
    }

    /// Fold the buffered raw chunks into the merged segment, keeping at most
    /// `offset + limit` rows.
    fn sort_and_merge(&mut self, state: &RuntimeState) -> Result<()> {
        if self.raw_chunks.is_empty() {
            return Ok(());
        }
        let raw_chunks = std::mem::take(&mut self.raw_chunks);
        self.raw_bytes = 0;

        self.shared.ensure_converter(&raw_chunks[0])?;
        let tracker = self.shared.tracker(state);
        let converter = self.shared.converter()?;
        let sort_exprs = &self.shared.sort_exprs;

        let mut segments = Vec::with_capacity(raw_chunks.len());
        for chunk in raw_chunks {
            segments.push(DataSegment::new(sort_exprs, converter, chunk)?);
        }

        let rows_to_sort = self.rows_to_sort();
        let merged = match self.merged_segment.take() {
            None => {
                let _t = self.shared.sort_scope();
                sorted_segment_from(
                    sort_exprs,
                    converter,
                    &segments,
                    None,
                    rows_to_sort,
                    tracker.as_ref(),
                )?
            }
            Some(merged) if merged.chunk.len() >= rows_to_sort => {
                let _t = self.shared.merge_scope();
                let mut scratch: Vec<TrackedBytes> = Vec::new();
                let classified =
                    merged.get_filter_array(&segments, rows_to_sort, sort_exprs, |bytes| {
                        if bytes > 0
                            && let Some(tracker) = tracker.as_ref()
                        {
                            scratch.push(TrackedBytes::try_new(bytes, Arc::clone(tracker))?);
                        }
                        Ok(())
                    })?;
                if classified.least_num >= rows_to_sort {
                    // Enough new rows precede the whole segment, which can
                    // be dropped outright.
                    sorted_segment_from(
                        sort_exprs,
                        converter,
                        &segments,
                        Some((&classified.filter_array, BEFORE_LAST_RESULT)),
                        rows_to_sort,
                        tracker.as_ref(),
                    )?
                } else if classified.least_num + classified.middle_num == 0 {
                    Some(merged)
                } else {
                    let survivors = sorted_segment_from(
                        sort_exprs,
                        converter,
                        &segments,
                        Some((&classified.filter_array, IN_LAST_RESULT)),
                        rows_to_sort,
                        tracker.as_ref(),
                    )?;
                    match survivors {
                        None => Some(merged),
                        Some(survivors) => {
                            let chunk = merge_sorted_segments(&merged, &survivors, rows_to_sort)?;
                            Some(DataSegment::new(sort_exprs, converter, chunk)?)
                        }
                    }
                }
            }
            Some(merged) => {
                // The segment has not reached offset + limit rows yet, so
                // there is no boundary to cut with. Merge everything.
                let _t = self.shared.merge_scope();
                let candidate = sorted_segment_from(
                    sort_exprs,
                    converter,
                    &segments,
                    None,
                    rows_to_sort,
                    tracker.as_ref(),
                )?;
                match candidate {
                    None => Some(merged),
                    Some(candidate) => {
                        let chunk = merge_sorted_segments(&merged, &candidate, rows_to_sort)?;
                        Some(DataSegment::new(sort_exprs, converter, chunk)?)
                    }
                }
            }
        };
        self.merged_segment = merged;
        self.merged_bytes = self
            .merged_segment
            .as_ref()
            .map(DataSegment::memory_usage)
            .unwrap_or(0);
        debug!(
            "TopNSorter cycle: input_segments={} kept_rows={}",
            segments.len(),
            self.merged_segment.as_ref().map(|s| s.chunk.len()).unwrap_or(0)
        );
        Ok(())
    }
}

impl ChunksSorter for ChunksSorterTopN {
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

/// Sort the rows of `segments` selected by `filter` (rows whose filter value
/// reaches the threshold; `None` selects everything) and materialize the
/// first `rows_to_keep` of them as a new segment.
fn sorted_segment_from(
    sort_exprs: &[SortExpr],
    converter: &RowConverter,
    segments: &[DataSegment],
    filter: Option<(&[Vec<u8>], u8)>,
    rows_to_keep: usize,
    tracker: Option<&Arc<MemTracker>>,
) -> Result<Option<DataSegment>> {
    let mut permutation = build_permutation(segments, filter);
    if permutation.is_empty() {
        return Ok(None);
    }
    // Account the permutation scratch before sorting it; released when the
    // cycle finishes.
    let _permutation_bytes = match tracker {
        Some(tracker) => Some(TrackedBytes::try_new(
            permutation.len() * size_of::<PermutationItem>(),
            Arc::clone(tracker),
        )?),
        None => None,
    };
    sort_permutation(segments, &mut permutation);
    permutation.truncate(rows_to_keep);
    let chunks = segments.iter().map(|s| s.chunk.clone()).collect::<Vec<_>>();
    let chunk = materialize_by_permutation(&chunks, &permutation)?;
    Ok(Some(DataSegment::new(sort_exprs, converter, chunk)?))
}

fn build_permutation(segments: &[DataSegment], filter: Option<(&[Vec<u8>], u8)>) -> Permutation {
    let mut permutation = Vec::new();
    for (chunk_index, segment) in segments.iter().enumerate() {
        for index_in_chunk in 0..segment.chunk.len() {
            let keep = match filter {
                None => true,
                Some((filter_array, threshold)) => {
                    filter_array[chunk_index][index_in_chunk] >= threshold
                }
            };
            if keep {
                permutation.push(PermutationItem {
                    chunk_index: chunk_index as u32,
                    index_in_chunk: index_in_chunk as u32,
                });
            }
        }
    }
    permutation
}

/// Two-way merge of two sorted segments into one chunk of at most
/// `rows_to_keep` rows. Ties go to `first`, which holds the older rows.
fn merge_sorted_segments(
    first: &DataSegment,
    second: &DataSegment,
    rows_to_keep: usize,
) -> Result<Chunk> {
    let total = first.chunk.len() + second.chunk.len();
    let mut permutation: Permutation = Vec::with_capacity(total.min(rows_to_keep));
    let mut i = 0;
    let mut j = 0;
    while permutation.len() < rows_to_keep && (i < first.chunk.len() || j < second.chunk.len()) {
        let take_first = if i >= first.chunk.len() {
            false
        } else if j >= second.chunk.len() {
            true
        } else {
            first.compare_at(i, second, j) != Ordering::Greater
        };
        if take_first {
            permutation.push(PermutationItem {
                chunk_index: 0,
                index_in_chunk: i as u32,
            });
            i += 1;
        } else {
            permutation.push(PermutationItem {
                chunk_index: 1,
                index_in_chunk: j as u32,
            });
            j += 1;
        }
    }
    materialize_by_permutation(&[first.chunk.clone(), second.chunk.clone()], &permutation)
}
