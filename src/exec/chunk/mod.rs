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
use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::datatypes::{Schema, SchemaRef};

use crate::common::error::{Error, Result};
use crate::common::ids::SlotId;

/// A chunk of data, consisting of multiple rows stored column by column.
/// Wrapper around an Arrow RecordBatch plus the slot id mapping carried in
/// the schema's field metadata.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    slot_id_to_index: Arc<HashMap<SlotId, usize>>,
}

impl Chunk {
    pub fn try_new(batch: RecordBatch) -> Result<Self> {
        let slot_id_to_index = slot_id_to_index_from_schema(batch.schema().as_ref())?;
        Ok(Self {
            batch,
            slot_id_to_index: Arc::new(slot_id_to_index),
        })
    }

    pub fn new(batch: RecordBatch) -> Self {
        match Self::try_new(batch) {
            Ok(v) => v,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn column_by_slot_id(&self, slot_id: SlotId) -> Result<ArrayRef> {
        let idx = self
            .slot_id_to_index
            .get(&slot_id)
            .copied()
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "slot id {} not found in chunk (num_columns={}, slot_ids={:?})",
                    slot_id,
                    self.batch.num_columns(),
                    self.slot_id_to_index.keys().collect::<Vec<_>>()
                ))
            })?;
        self.batch.columns().get(idx).cloned().ok_or_else(|| {
            Error::Internal(format!("slot id {} mapped to invalid index {}", slot_id, idx))
        })
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
            slot_id_to_index: Arc::clone(&self.slot_id_to_index),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

pub const FIELD_META_SLOT_ID: &str = "chunksort.slot_id";

pub fn field_with_slot_id(
    field: arrow::datatypes::Field,
    slot_id: SlotId,
) -> arrow::datatypes::Field {
    let mut meta = field.metadata().clone();
    meta.insert(FIELD_META_SLOT_ID.to_string(), slot_id.to_string());
    field.with_metadata(meta)
}

pub fn field_slot_id(field: &arrow::datatypes::Field) -> Result<Option<SlotId>> {
    let Some(v) = field.metadata().get(FIELD_META_SLOT_ID) else {
        return Ok(None);
    };
    Ok(Some(v.parse::<SlotId>()?))
}

fn slot_id_to_index_from_schema(schema: &Schema) -> Result<HashMap<SlotId, usize>> {
    let mut map = HashMap::new();
    for (idx, f) in schema.fields().iter().enumerate() {
        let slot_id = field_slot_id(f.as_ref())?.ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "missing {} in chunk schema field at index {} (name={})",
                FIELD_META_SLOT_ID,
                idx,
                f.name()
            ))
        })?;
        if map.insert(slot_id, idx).is_some() {
            // Slot id collision in a single chunk is a logic error and would make expression evaluation ambiguous.
            let mut slots = Vec::new();
            for (i, ff) in schema.fields().iter().enumerate() {
                slots.push((
                    i,
                    ff.name().to_string(),
                    field_slot_id(ff.as_ref())?.map(|v| v.to_string()),
                ));
            }
            return Err(Error::InvalidConfiguration(format!(
                "duplicate slot id {} in chunk schema: fields={:?}",
                slot_id, slots
            )));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field};
    use std::sync::Arc;

    #[test]
    fn requires_slot_id_metadata_for_all_fields() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(vec![1, 2]))])
            .expect("record batch");
        let err = Chunk::try_new(batch).expect_err("expected metadata error");
        assert!(err.to_string().contains(FIELD_META_SLOT_ID), "err={}", err);
    }

    #[test]
    fn rejects_duplicate_slot_id() {
        let schema = Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("a", DataType::Int32, true), SlotId::new(1)),
            field_with_slot_id(Field::new("b", DataType::Int32, true), SlotId::new(1)),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(Int32Array::from(vec![3, 4])),
            ],
        )
        .expect("record batch");
        let err = Chunk::try_new(batch).expect_err("expected duplicate error");
        assert!(err.to_string().contains("duplicate slot id"), "err={}", err);
    }

    #[test]
    fn resolves_columns_by_slot_id_not_position() {
        let schema = Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("a", DataType::Int32, true), SlotId::new(7)),
            field_with_slot_id(Field::new("b", DataType::Int32, true), SlotId::new(3)),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(Int32Array::from(vec![3, 4])),
            ],
        )
        .expect("record batch");
        let chunk = Chunk::try_new(batch).expect("chunk");
        let col = chunk.column_by_slot_id(SlotId::new(3)).expect("column");
        let col = col.as_any().downcast_ref::<Int32Array>().expect("i32");
        assert_eq!(col.values(), &[3, 4]);
        assert!(chunk.column_by_slot_id(SlotId::new(9)).is_err());
    }
}

