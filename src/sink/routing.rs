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
//! Row routing: range-partition selection over the partition key columns,
//! then bucket selection by hashing the distributed columns. The same bucket
//! number addresses the corresponding tablet of every index of a partition.
use std::cmp::Ordering;
use std::collections::HashMap;

use arrow::array::{
    Array, ArrayRef, Date32Array, Decimal128Array, Int8Array, Int16Array, Int32Array, Int64Array,
    StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};

use crate::exec::chunk::Chunk;
use crate::sink::descriptors::{PartitionKey, TablePartitionParam, TableSchemaParam};
use crate::sink::error::{SinkError, SinkResult};
use crate::sink::validate::FilterBitmap;

#[derive(Clone, Debug)]
struct RoutingPartition {
    partition_id: i64,
    start_keys: Vec<PartitionKey>,
    end_keys: Vec<PartitionKey>,
    num_buckets: usize,
    tablets_by_index: HashMap<i64, Vec<i64>>,
}

/// Destination of one valid row, index-independent: the tablet of index `i`
/// is `tablet(partition, index_id, bucket)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowTarget {
    pub partition_idx: usize,
    pub bucket: usize,
}

pub struct TabletRouter {
    partition_col_idx: Vec<usize>,
    distributed_col_idx: Vec<usize>,
    partitions: Vec<RoutingPartition>,
}

impl TabletRouter {
    pub fn new(
        schema: &TableSchemaParam,
        partition: &TablePartitionParam,
    ) -> SinkResult<Self> {
        let partition_col_idx = resolve_columns(schema, &partition.partition_columns)?;
        let distributed_col_idx = resolve_columns(schema, &partition.distributed_columns)?;

        let mut partitions = Vec::with_capacity(partition.partitions.len());
        for desc in &partition.partitions {
            for keys in [&desc.start_keys, &desc.end_keys] {
                if !keys.is_empty() && keys.len() != partition_col_idx.len() {
                    return Err(SinkError::InvalidConfig(format!(
                        "partition {} key length {} does not match partition columns {}",
                        desc.partition_id,
                        keys.len(),
                        partition_col_idx.len()
                    )));
                }
            }
            let tablets_by_index = desc
                .indexes
                .iter()
                .map(|index| (index.index_id, index.tablet_ids.clone()))
                .collect();
            partitions.push(RoutingPartition {
                partition_id: desc.partition_id,
                start_keys: desc.start_keys.clone(),
                end_keys: desc.end_keys.clone(),
                num_buckets: desc.num_buckets as usize,
                tablets_by_index,
            });
        }

        Ok(Self {
            partition_col_idx,
            distributed_col_idx,
            partitions,
        })
    }

    pub fn partition_id(&self, partition_idx: usize) -> i64 {
        self.partitions[partition_idx].partition_id
    }

    pub fn tablet(
        &self,
        partition_idx: usize,
        index_id: i64,
        bucket: usize,
    ) -> SinkResult<i64> {
        let partition = self.partitions.get(partition_idx).ok_or_else(|| {
            SinkError::Internal(format!("invalid partition routing index {partition_idx}"))
        })?;
        let tablets = partition.tablets_by_index.get(&index_id).ok_or_else(|| {
            SinkError::Internal(format!(
                "partition {} has no tablets for index {}",
                partition.partition_id, index_id
            ))
        })?;
        tablets.get(bucket).copied().ok_or_else(|| {
            SinkError::Internal(format!(
                "bucket {} out of range for partition {} index {}",
                bucket, partition.partition_id, index_id
            ))
        })
    }

    /// Compute the destination of every unfiltered row. Rows whose partition
    /// key falls outside all partitions are marked in `filter`; that is a
    /// routing miss, not an error.
    pub fn route_chunk(
        &self,
        chunk: &Chunk,
        filter: &mut FilterBitmap,
        next_random_bucket: &mut u32,
    ) -> SinkResult<Vec<Option<RowTarget>>> {
        let partition_arrays = self.collect_arrays(chunk, &self.partition_col_idx)?;
        let distributed_arrays = self.collect_arrays(chunk, &self.distributed_col_idx)?;

        let mut targets = vec![None; chunk.len()];
        for row in 0..chunk.len() {
            if filter.is_filtered(row) {
                continue;
            }

            let row_key = partition_arrays
                .iter()
                .map(|array| partition_key_value(array, row))
                .collect::<Result<Vec<_>, _>>()?;
            let Some(partition_idx) = self.select_partition(&row_key)? else {
                filter.mark(row);
                continue;
            };

            let hash = if distributed_arrays.is_empty() {
                let h = *next_random_bucket;
                *next_random_bucket = next_random_bucket.wrapping_add(1);
                h
            } else {
                let mut hash = 0_u32;
                for array in &distributed_arrays {
                    hash = crc32_hash_array_value(array.as_ref(), row, hash)?;
                }
                hash
            };
            let bucket = (hash as usize) % self.partitions[partition_idx].num_buckets;
            targets[row] = Some(RowTarget {
                partition_idx,
                bucket,
            });
        }
        Ok(targets)
    }

    fn collect_arrays(&self, chunk: &Chunk, indices: &[usize]) -> SinkResult<Vec<ArrayRef>> {
        indices
            .iter()
            .map(|idx| {
                chunk.columns().get(*idx).cloned().ok_or_else(|| {
                    SinkError::Internal(format!("routing column index {idx} out of range"))
                })
            })
            .collect()
    }

    fn select_partition(&self, row_key: &[PartitionKey]) -> SinkResult<Option<usize>> {
        for (idx, partition) in self.partitions.iter().enumerate() {
            // Unpartitioned tables carry a single partition with open bounds.
            let ge_start = partition.start_keys.is_empty()
                || compare_keys(row_key, &partition.start_keys)? != Ordering::Less;
            if !ge_start {
                continue;
            }
            let lt_end = partition.end_keys.is_empty()
                || compare_keys(row_key, &partition.end_keys)? == Ordering::Less;
            if lt_end {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }
}

fn resolve_columns(schema: &TableSchemaParam, names: &[String]) -> SinkResult<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            schema.column_index(name).ok_or_else(|| {
                SinkError::InvalidConfig(format!("routing column {name} not found in schema"))
            })
        })
        .collect()
}

fn compare_keys(row_key: &[PartitionKey], bound: &[PartitionKey]) -> SinkResult<Ordering> {
    for (value, limit) in row_key.iter().zip(bound.iter()) {
        let ordering = match (value, limit) {
            (PartitionKey::Int(a), PartitionKey::Int(b)) => a.cmp(b),
            (PartitionKey::Text(a), PartitionKey::Text(b)) => a.cmp(b),
            (a, b) => {
                return Err(SinkError::Internal(format!(
                    "partition key type mismatch: row={a:?} bound={b:?}"
                )));
            }
        };
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}

fn partition_key_value(array: &ArrayRef, row: usize) -> SinkResult<PartitionKey> {
    if array.is_null(row) {
        // Null range keys sort below every bound.
        return Ok(PartitionKey::Int(i64::MIN));
    }
    let value = match array.data_type() {
        DataType::Int8 => downcast::<Int8Array>(array)?.value(row) as i64,
        DataType::Int16 => downcast::<Int16Array>(array)?.value(row) as i64,
        DataType::Int32 => downcast::<Int32Array>(array)?.value(row) as i64,
        DataType::Int64 => downcast::<Int64Array>(array)?.value(row),
        DataType::Date32 => downcast::<Date32Array>(array)?.value(row) as i64,
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            downcast::<TimestampMicrosecondArray>(array)?.value(row)
        }
        DataType::Utf8 => {
            return Ok(PartitionKey::Text(
                downcast::<StringArray>(array)?.value(row).to_string(),
            ));
        }
        other => {
            return Err(SinkError::Internal(format!(
                "unsupported partition key type: {other:?}"
            )));
        }
    };
    Ok(PartitionKey::Int(value))
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> SinkResult<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        SinkError::Internal(format!(
            "downcast failed for array type {:?}",
            array.data_type()
        ))
    })
}

fn crc32_hash_array_value(array: &dyn Array, row: usize, seed: u32) -> SinkResult<u32> {
    if array.is_null(row) {
        return Ok(zlib_crc_hash(&0_i32.to_le_bytes(), seed));
    }
    let hash = match array.data_type() {
        DataType::Int8 => zlib_crc_hash(
            &array
                .as_any()
                .downcast_ref::<Int8Array>()
                .ok_or_else(|| SinkError::Internal("downcast Int8Array failed".to_string()))?
                .value(row)
                .to_le_bytes(),
            seed,
        ),
        DataType::Int16 => zlib_crc_hash(
            &array
                .as_any()
                .downcast_ref::<Int16Array>()
                .ok_or_else(|| SinkError::Internal("downcast Int16Array failed".to_string()))?
                .value(row)
                .to_le_bytes(),
            seed,
        ),
        DataType::Int32 => zlib_crc_hash(
            &array
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| SinkError::Internal("downcast Int32Array failed".to_string()))?
                .value(row)
                .to_le_bytes(),
            seed,
        ),
        DataType::Int64 => zlib_crc_hash(
            &array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| SinkError::Internal("downcast Int64Array failed".to_string()))?
                .value(row)
                .to_le_bytes(),
            seed,
        ),
        DataType::Date32 => zlib_crc_hash(
            &array
                .as_any()
                .downcast_ref::<Date32Array>()
                .ok_or_else(|| SinkError::Internal("downcast Date32Array failed".to_string()))?
                .value(row)
                .to_le_bytes(),
            seed,
        ),
        DataType::Timestamp(TimeUnit::Microsecond, _) => zlib_crc_hash(
            &array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(|| {
                    SinkError::Internal("downcast TimestampMicrosecondArray failed".to_string())
                })?
                .value(row)
                .to_le_bytes(),
            seed,
        ),
        DataType::Utf8 => zlib_crc_hash(
            array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| SinkError::Internal("downcast StringArray failed".to_string()))?
                .value(row)
                .as_bytes(),
            seed,
        ),
        DataType::Decimal128(_, _) => zlib_crc_hash(
            &array
                .as_any()
                .downcast_ref::<Decimal128Array>()
                .ok_or_else(|| {
                    SinkError::Internal("downcast Decimal128Array failed".to_string())
                })?
                .value(row)
                .to_le_bytes(),
            seed,
        ),
        other => {
            return Err(SinkError::Internal(format!(
                "unsupported distributed hash type: {other:?}"
            )));
        }
    };
    Ok(hash)
}

fn zlib_crc_hash(data: &[u8], seed: u32) -> u32 {
    let mut crc = seed ^ 0xffff_ffff;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xedb8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc ^ 0xffff_ffff
}
