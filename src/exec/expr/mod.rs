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
//! Sort key expression seam.
//!
//! Responsibilities:
//! - Define the boundary the sorters evaluate order-by keys through, so a
//!   richer expression engine can plug in without the sort code caring.
//! - Provide the stock slot reference used when keys are plain columns.

use std::fmt;

use arrow::array::ArrayRef;

use crate::common::error::Result;
use crate::common::ids::SlotId;
use crate::exec::chunk::Chunk;

/// An order-by key evaluated against one chunk.
///
/// Evaluated once per chunk per key; the resulting column lives as long as
/// the chunk it was computed from.
pub trait SortKeyExpr: fmt::Debug + Send + Sync {
    fn evaluate(&self, chunk: &Chunk) -> Result<ArrayRef>;
}

/// Column reference by slot id.
#[derive(Debug, Clone, Copy)]
pub struct SlotRef {
    pub slot_id: SlotId,
}

impl SlotRef {
    pub fn new(slot_id: SlotId) -> Self {
        Self { slot_id }
    }
}

impl SortKeyExpr for SlotRef {
    fn evaluate(&self, chunk: &Chunk) -> Result<ArrayRef> {
        chunk.column_by_slot_id(self.slot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    use crate::exec::chunk::field_with_slot_id;

    #[test]
    fn slot_ref_resolves_through_chunk_metadata() {
        let schema = Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("a", DataType::Int32, true), SlotId::new(5)),
            field_with_slot_id(Field::new("b", DataType::Int32, true), SlotId::new(2)),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![10, 20])),
                Arc::new(Int32Array::from(vec![30, 40])),
            ],
        )
        .expect("record batch");
        let chunk = Chunk::try_new(batch).expect("chunk");

        let col = SlotRef::new(SlotId::new(2)).evaluate(&chunk).expect("column");
        let col = col.as_any().downcast_ref::<Int32Array>().expect("i32");
        assert_eq!(col.values(), &[30, 40]);

        assert!(SlotRef::new(SlotId::new(99)).evaluate(&chunk).is_err());
    }
}
