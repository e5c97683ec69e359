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
//! Row validation against the destination column domains.
//!
//! Invalid rows are marked in the filter bitmap and excluded from routing;
//! they are counted, never errored. A load does not fail because rows were
//! filtered.
use arrow::array::{Array, Decimal128Array, StringArray};

use crate::exec::chunk::Chunk;
use crate::sink::descriptors::{ColumnDesc, ColumnType};
use crate::sink::error::{SinkError, SinkResult};
use crate::tabletload_logging::debug;

/// Marks rows excluded from the load. One bit per row of the output chunk.
pub struct FilterBitmap {
    bits: Vec<bool>,
    num_filtered: usize,
}

impl FilterBitmap {
    pub fn new(num_rows: usize) -> Self {
        Self {
            bits: vec![false; num_rows],
            num_filtered: 0,
        }
    }

    pub fn mark(&mut self, row: usize) {
        if !self.bits[row] {
            self.bits[row] = true;
            self.num_filtered += 1;
        }
    }

    pub fn is_filtered(&self, row: usize) -> bool {
        self.bits[row]
    }

    pub fn num_filtered(&self) -> usize {
        self.num_filtered
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Per-column decimal bounds, precomputed once at prepare so the send path
/// does no digit arithmetic.
#[derive(Clone, Debug)]
pub struct DecimalBounds {
    pub min: i128,
    pub max: i128,
}

pub fn decimal_bounds(columns: &[ColumnDesc]) -> Vec<Option<DecimalBounds>> {
    columns
        .iter()
        .map(|col| match col.column_type {
            ColumnType::Decimal { precision, .. } => {
                let max = 10_i128.saturating_pow(precision as u32) - 1;
                Some(DecimalBounds { min: -max, max })
            }
            _ => None,
        })
        .collect()
}

/// Validate every row of `chunk` against the destination columns; rows that
/// violate a domain are marked in `filter`. Returns the number of rows newly
/// filtered by this pass.
pub fn validate_chunk(
    columns: &[ColumnDesc],
    bounds: &[Option<DecimalBounds>],
    chunk: &Chunk,
    filter: &mut FilterBitmap,
) -> SinkResult<usize> {
    if chunk.columns().len() != columns.len() {
        return Err(SinkError::Internal(format!(
            "validate column count mismatch: chunk={} schema={}",
            chunk.columns().len(),
            columns.len()
        )));
    }
    let before = filter.num_filtered();
    for (col_idx, desc) in columns.iter().enumerate() {
        let array = &chunk.columns()[col_idx];
        if !desc.is_nullable {
            for row in 0..chunk.len() {
                if filter.is_filtered(row) {
                    continue;
                }
                if array.is_null(row) {
                    debug!(
                        "filter row {}: null value in non-nullable column {}",
                        row, desc.name
                    );
                    filter.mark(row);
                }
            }
        }
        match &desc.column_type {
            ColumnType::Varchar { len } => {
                let typed = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| {
                        SinkError::Internal(format!(
                            "column {} is declared VARCHAR but carries {:?}",
                            desc.name,
                            array.data_type()
                        ))
                    })?;
                for row in 0..chunk.len() {
                    if filter.is_filtered(row) || typed.is_null(row) {
                        continue;
                    }
                    if typed.value(row).len() > *len {
                        debug!(
                            "filter row {}: string length {} exceeds {} in column {}",
                            row,
                            typed.value(row).len(),
                            len,
                            desc.name
                        );
                        filter.mark(row);
                    }
                }
            }
            ColumnType::Decimal { .. } => {
                let typed = array
                    .as_any()
                    .downcast_ref::<Decimal128Array>()
                    .ok_or_else(|| {
                        SinkError::Internal(format!(
                            "column {} is declared DECIMAL but carries {:?}",
                            desc.name,
                            array.data_type()
                        ))
                    })?;
                let bound = bounds
                    .get(col_idx)
                    .and_then(|b| b.as_ref())
                    .ok_or_else(|| {
                        SinkError::Internal(format!(
                            "missing decimal bounds for column {}",
                            desc.name
                        ))
                    })?;
                for row in 0..chunk.len() {
                    if filter.is_filtered(row) || typed.is_null(row) {
                        continue;
                    }
                    let value = typed.value(row);
                    if value < bound.min || value > bound.max {
                        debug!(
                            "filter row {}: decimal value out of range in column {}",
                            row, desc.name
                        );
                        filter.mark(row);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(filter.num_filtered() - before)
}
