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
//! Row permutations over a set of buffered chunks.
//!
//! A permutation names rows as (chunk, row) pairs so a sort can order them
//! without moving any data; materialization copies the named rows out in
//! permutation order, merging neighbouring rows from the same chunk into a
//! single copy range.

use arrow::array::{ArrayData, ArrayRef, MutableArrayData, RecordBatch, make_array};

use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;

/// One row address inside a list of buffered chunks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PermutationItem {
    pub(crate) chunk_index: u32,
    pub(crate) index_in_chunk: u32,
}

pub(crate) type Permutation = Vec<PermutationItem>;

/// Copy the rows named by `items` out of `chunks`, in order, into one chunk.
///
/// All chunks must share a schema; the output carries the same one.
pub(crate) fn materialize_by_permutation(chunks: &[Chunk], items: &[PermutationItem]) -> Result<Chunk> {
    let schema = chunks
        .first()
        .ok_or_else(|| {
            Error::Internal("materialize_by_permutation requires at least one source chunk".to_string())
        })?
        .schema();

    // (chunk, start, end) copy ranges, greedily extended while the next row
    // continues the current one.
    let mut runs: Vec<(usize, usize, usize)> = Vec::new();
    for item in items {
        let chunk = item.chunk_index as usize;
        let row = item.index_in_chunk as usize;
        match runs.last_mut() {
            Some((c, _, end)) if *c == chunk && *end == row => *end += 1,
            _ => runs.push((chunk, row, row + 1)),
        }
    }

    let num_columns = schema.fields().len();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(num_columns);
    for col_idx in 0..num_columns {
        let arrays: Vec<ArrayData> = chunks
            .iter()
            .map(|c| c.batch.column(col_idx).to_data())
            .collect();
        let array_refs: Vec<&ArrayData> = arrays.iter().collect();
        let mut mutable = MutableArrayData::new(array_refs, false, items.len());
        for (chunk, start, end) in &runs {
            mutable.extend(*chunk, *start, *end);
        }
        columns.push(make_array(mutable.freeze()));
    }

    let batch = RecordBatch::try_new(schema, columns)?;
    Chunk::try_new(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use arrow::array::{Array, Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

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

    fn item(chunk_index: u32, index_in_chunk: u32) -> PermutationItem {
        PermutationItem {
            chunk_index,
            index_in_chunk,
        }
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

    #[test]
    fn materializes_rows_across_chunks_in_permutation_order() {
        let chunks = vec![
            chunk(vec![Some(1), None, Some(3)], vec![Some("a"), Some("b"), None]),
            chunk(vec![Some(4), Some(5)], vec![None, Some("e")]),
        ];
        let items = vec![item(1, 1), item(0, 1), item(1, 0), item(0, 0)];

        let out = materialize_by_permutation(&chunks, &items).expect("chunk");
        assert_eq!(collect_keys(&out), vec![Some(5), None, Some(4), Some(1)]);

        let names = out
            .batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert!(names.is_null(2));
        assert_eq!(names.value(0), "e");
        assert_eq!(names.value(3), "a");
    }

    #[test]
    fn consecutive_rows_copy_as_one_range() {
        let chunks = vec![chunk(
            vec![Some(1), Some(2), Some(3), Some(4)],
            vec![Some("a"), Some("b"), Some("c"), Some("d")],
        )];
        let items = vec![item(0, 1), item(0, 2), item(0, 3)];

        let out = materialize_by_permutation(&chunks, &items).expect("chunk");
        assert_eq!(collect_keys(&out), vec![Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn empty_permutation_yields_an_empty_chunk() {
        let chunks = vec![chunk(vec![Some(1)], vec![Some("a")])];
        let out = materialize_by_permutation(&chunks, &[]).expect("chunk");
        assert!(out.is_empty());
        assert_eq!(out.schema(), chunks[0].schema());
    }
}
