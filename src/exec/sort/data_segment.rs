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
//! A buffered chunk bundled with its evaluated order-by keys.
//!
//! Responsibilities:
//! - Carry the key columns and their row-format encoding next to the data
//!   so later passes never re-evaluate sort expressions.
//! - Classify candidate rows against a sorted result segment, column by
//!   column, keeping only still-tied rows for the next key.

use std::cmp::Ordering;
use std::mem::size_of;

use arrow::array::{ArrayRef, make_comparator};
use arrow::compute::SortOptions;
use arrow::row::{RowConverter, Rows};

use crate::common::error::Result;
use crate::exec::chunk::Chunk;
use crate::exec::sort::{SortExpr, eval_order_by_columns};

/// Marks a row that precedes every row of the sorted result segment.
pub(crate) const BEFORE_LAST_RESULT: u8 = 2;
/// Marks a row that falls inside the sorted result segment's key range and
/// has to be merged with it.
pub(crate) const IN_LAST_RESULT: u8 = 1;

/// Per-segment row classification produced by [`DataSegment::get_filter_array`].
#[derive(Debug)]
pub(crate) struct FilterArrayResult {
    /// One entry per segment row: `BEFORE_LAST_RESULT`, `IN_LAST_RESULT` or
    /// 0 for rows that cannot reach the result.
    pub(crate) filter_array: Vec<Vec<u8>>,
    /// Rows marked `BEFORE_LAST_RESULT` across all segments.
    pub(crate) least_num: usize,
    /// Rows marked `IN_LAST_RESULT` across all segments.
    pub(crate) middle_num: usize,
}

/// A chunk plus its order-by key columns and their row-format encoding.
///
/// All segments compared with each other must share one `RowConverter`, so
/// the encoded rows order consistently.
pub(crate) struct DataSegment {
    pub(crate) chunk: Chunk,
    pub(crate) order_by_columns: Vec<ArrayRef>,
    pub(crate) rows: Rows,
}

impl DataSegment {
    pub(crate) fn new(sort_exprs: &[SortExpr], converter: &RowConverter, chunk: Chunk) -> Result<Self> {
        let order_by_columns = eval_order_by_columns(sort_exprs, &chunk)?;
        let rows = converter.convert_columns(&order_by_columns)?;
        Ok(Self {
            chunk,
            order_by_columns,
            rows,
        })
    }

    /// Compare this segment's row `index_in_chunk` with `other`'s row
    /// `index_in_other` in output order.
    pub(crate) fn compare_at(&self, index_in_chunk: usize, other: &DataSegment, index_in_other: usize) -> Ordering {
        self.rows.row(index_in_chunk).cmp(&other.rows.row(index_in_other))
    }

    /// Bytes held by the chunk plus its key encoding.
    pub(crate) fn memory_usage(&self) -> i64 {
        (self.chunk.estimated_bytes() + self.rows.size()) as i64
    }

    /// Classify every row of `segments` against this sorted segment, which
    /// holds the current best `rows_to_sort` rows.
    ///
    /// Two comparison sweeps, each narrowing column by column:
    /// 1. against row `rows_to_sort - 1` (the worst retained row); strictly
    ///    smaller rows become `IN_LAST_RESULT` candidates, everything else
    ///    is cut.
    /// 2. survivors against row 0; rows before the whole segment are
    ///    upgraded to `BEFORE_LAST_RESULT` and leave the merge set.
    ///
    /// With `rows_to_sort == 1` both boundary rows coincide, so a single
    /// sweep splits rows into `BEFORE_LAST_RESULT` and `IN_LAST_RESULT`
    /// and no row is cut.
    ///
    /// `consume_and_check` is invoked between the sweeps with the scratch
    /// bytes about to be allocated, so the caller can account them and bail
    /// out before the second sweep.
    pub(crate) fn get_filter_array(
        &self,
        segments: &[DataSegment],
        rows_to_sort: usize,
        sort_exprs: &[SortExpr],
        mut consume_and_check: impl FnMut(usize) -> Result<()>,
    ) -> Result<FilterArrayResult> {
        debug_assert!(rows_to_sort >= 1 && rows_to_sort <= self.chunk.len());

        let segment_count = segments.len();
        let mut compare_results: Vec<Vec<i8>> =
            segments.iter().map(|s| vec![0i8; s.chunk.len()]).collect();

        // First sweep, against the worst retained row.
        {
            let mut rows_to_compare: Vec<Vec<u64>> = segments
                .iter()
                .map(|s| (0..s.chunk.len() as u64).collect())
                .collect();
            self.compare_segments_with_row(
                rows_to_sort - 1,
                segments,
                &mut rows_to_compare,
                &mut compare_results,
                sort_exprs,
            )?;
        }

        let mut filter_array: Vec<Vec<u8>> = Vec::with_capacity(segment_count);
        let mut least_num = 0usize;
        let mut middle_num = 0usize;

        if rows_to_sort == 1 {
            consume_and_check(0)?;

            for (i, segment) in segments.iter().enumerate() {
                let rows = segment.chunk.len();
                let mut filter = vec![0u8; rows];
                for (j, slot) in filter.iter_mut().enumerate() {
                    if compare_results[i][j] < 0 {
                        *slot = BEFORE_LAST_RESULT;
                        least_num += 1;
                    } else {
                        *slot = IN_LAST_RESULT;
                        middle_num += 1;
                    }
                }
                filter_array.push(filter);
            }
        } else {
            let mut first_size_array = vec![0usize; segment_count];
            for (i, segment) in segments.iter().enumerate() {
                let rows = segment.chunk.len();
                let mut filter = vec![0u8; rows];
                let local_first_size = middle_num;
                for (j, slot) in filter.iter_mut().enumerate() {
                    if compare_results[i][j] < 0 {
                        *slot = IN_LAST_RESULT;
                        middle_num += 1;
                    }
                }
                first_size_array[i] = middle_num - local_first_size;
                filter_array.push(filter);
            }

            consume_and_check(segment_count * size_of::<usize>() + middle_num * size_of::<u64>())?;

            // Second sweep, against the first retained row, restricted to
            // the survivors of the first sweep.
            {
                let mut rows_to_compare: Vec<Vec<u64>> = Vec::with_capacity(segment_count);
                for (i, segment) in segments.iter().enumerate() {
                    let rows = segment.chunk.len();
                    let mut survivors = Vec::with_capacity(first_size_array[i]);
                    for j in 0..rows {
                        if compare_results[i][j] < 0 {
                            survivors.push(j as u64);
                        }
                        compare_results[i][j] = 0;
                    }
                    rows_to_compare.push(survivors);
                }
                self.compare_segments_with_row(
                    0,
                    segments,
                    &mut rows_to_compare,
                    &mut compare_results,
                    sort_exprs,
                )?;
            }

            for (i, segment) in segments.iter().enumerate() {
                for j in 0..segment.chunk.len() {
                    if compare_results[i][j] < 0 {
                        filter_array[i][j] = BEFORE_LAST_RESULT;
                        least_num += 1;
                    }
                }
            }
            middle_num -= least_num;
        }

        Ok(FilterArrayResult {
            filter_array,
            least_num,
            middle_num,
        })
    }

    /// Compare the listed rows of every segment with row `target_row` of
    /// this segment, one key column at a time.
    ///
    /// `compare_results[i][j]` receives -1/0/1 in output order. After each
    /// column, `rows_to_compare[i]` shrinks to the rows still tied, so later
    /// columns only touch undecided rows.
    fn compare_segments_with_row(
        &self,
        target_row: usize,
        segments: &[DataSegment],
        rows_to_compare: &mut [Vec<u64>],
        compare_results: &mut [Vec<i8>],
        sort_exprs: &[SortExpr],
    ) -> Result<()> {
        for (i, segment) in segments.iter().enumerate() {
            for (col_idx, expr) in sort_exprs.iter().enumerate() {
                if rows_to_compare[i].is_empty() {
                    break;
                }
                compare_column_with_row(
                    &segment.order_by_columns[col_idx],
                    &self.order_by_columns[col_idx],
                    target_row,
                    &mut rows_to_compare[i],
                    &mut compare_results[i],
                    expr.sort_options(),
                )?;
            }
        }
        Ok(())
    }
}

/// Compare the listed candidate rows with row `base_row` of `base`, writing
/// -1/0/1 into `compare_results` and compacting `rows_to_compare` down to
/// the rows that tied.
fn compare_column_with_row(
    candidate: &ArrayRef,
    base: &ArrayRef,
    base_row: usize,
    rows_to_compare: &mut Vec<u64>,
    compare_results: &mut [i8],
    options: SortOptions,
) -> Result<()> {
    let comparator = make_comparator(candidate.as_ref(), base.as_ref(), options)?;
    let mut kept = 0usize;
    for idx in 0..rows_to_compare.len() {
        let row = rows_to_compare[idx];
        let row_idx = row as usize;
        match comparator(row_idx, base_row) {
            Ordering::Less => compare_results[row_idx] = -1,
            Ordering::Greater => compare_results[row_idx] = 1,
            Ordering::Equal => {
                compare_results[row_idx] = 0;
                rows_to_compare[kept] = row;
                kept += 1;
            }
        }
    }
    rows_to_compare.truncate(kept);
    Ok(())
}
