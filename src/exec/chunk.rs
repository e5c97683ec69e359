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
use std::collections::HashSet;
use std::io::Cursor;

use arrow::array::{Array, ArrayRef, RecordBatch, UInt32Array};
use arrow::buffer::Buffer;
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;

/// A chunk of data, consisting of multiple rows.
/// Wrapper around an Arrow RecordBatch; all columns follow the destination
/// table's column order.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    /// Materialize the given rows into a freshly allocated batch. The result
    /// shares nothing with this chunk's buffers, so callers may hold it past
    /// the lifetime of the input batch.
    pub fn take_rows(&self, row_indices: &[u32]) -> Result<RecordBatch, String> {
        take_batch_rows(&self.batch, row_indices)
    }

    pub fn logical_bytes(&self) -> usize {
        record_batch_bytes(&self.batch)
    }
}

pub fn take_batch_rows(batch: &RecordBatch, row_indices: &[u32]) -> Result<RecordBatch, String> {
    let indices = UInt32Array::from(row_indices.to_vec());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for column in batch.columns() {
        let taken = arrow::compute::take(column.as_ref(), &indices, None)
            .map_err(|e| format!("take batch rows failed: {e}"))?;
        columns.push(taken);
    }
    RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| format!("rebuild batch from taken rows failed: {e}"))
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within a single batch; buffers shared
/// across batches (slices, dictionaries) are counted once per batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

/// Encode row batches into Arrow IPC stream format for transport.
pub fn encode_batches(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buffer, schema)
        .map_err(|e| format!("failed to create Arrow IPC writer: {e}"))?;
    for batch in batches {
        if batch.schema().as_ref() != schema.as_ref() {
            return Err(format!(
                "encode schema mismatch: expected={:?} actual={:?}",
                schema,
                batch.schema()
            ));
        }
        writer
            .write(batch)
            .map_err(|e| format!("failed to write batch: {e}"))?;
    }
    writer
        .finish()
        .map_err(|e| format!("failed to finish Arrow IPC writer: {e}"))?;
    Ok(buffer)
}

/// Decode row batches from Arrow IPC stream format.
pub fn decode_batches(bytes: &[u8]) -> Result<Vec<RecordBatch>, String> {
    if bytes.is_empty() {
        return Ok(vec![]);
    }
    let mut cursor = Cursor::new(bytes);
    let reader = StreamReader::try_new(&mut cursor, None)
        .map_err(|e| format!("failed to create Arrow IPC reader: {e}"))?;
    let mut batches = Vec::new();
    for batch_result in reader {
        let batch = batch_result.map_err(|e| format!("failed to read batch: {e}"))?;
        batches.push(batch);
    }
    Ok(batches)
}

/// Encode a schema alone (an IPC stream with no batches), used on the
/// tablet-writer open request.
pub fn encode_schema(schema: &SchemaRef) -> Result<Vec<u8>, String> {
    encode_batches(schema, &[])
}

/// Decode the schema of an IPC stream without requiring any batch payload.
pub fn decode_schema(bytes: &[u8]) -> Result<SchemaRef, String> {
    let mut cursor = Cursor::new(bytes);
    let reader = StreamReader::try_new(&mut cursor, None)
        .map_err(|e| format!("failed to create Arrow IPC reader: {e}"))?;
    Ok(reader.schema())
}
