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
//! Sink description record handed over by the query planner.
//!
//! The record binds the destination table's schema, partition layout, tablet
//! placement, and backend endpoints for the lifetime of one load. All of it
//! is frozen after `TabletSink` open.
use std::collections::HashMap;

use arrow::datatypes::{DataType, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::common::types::UniqueId;
use crate::sink::error::SinkError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Double,
    Varchar { len: usize },
    Decimal { precision: u8, scale: i8 },
    Date,
    Datetime,
}

impl ColumnType {
    pub fn to_arrow(&self) -> DataType {
        match self {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::TinyInt => DataType::Int8,
            ColumnType::SmallInt => DataType::Int16,
            ColumnType::Int => DataType::Int32,
            ColumnType::BigInt => DataType::Int64,
            ColumnType::Double => DataType::Float64,
            ColumnType::Varchar { .. } => DataType::Utf8,
            ColumnType::Decimal { precision, scale } => {
                DataType::Decimal128(*precision, *scale)
            }
            ColumnType::Date => DataType::Date32,
            ColumnType::Datetime => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub is_nullable: bool,
}

/// Physical layout of one materialized index (base table or rollup).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSchema {
    pub index_id: i64,
    pub schema_hash: i32,
    /// Columns materialized by this index, in storage order. Rollups carry a
    /// subset of the table columns; every entry must match a table column by
    /// name and type.
    pub columns: Vec<ColumnDesc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSchemaParam {
    pub db_id: i64,
    pub table_id: i64,
    pub columns: Vec<ColumnDesc>,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchemaParam {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }
}

/// One bound of a range partition, or one literal key value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    Int(i64),
    Text(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionIndexTablets {
    pub index_id: i64,
    /// One tablet per bucket, indexed by bucket number.
    pub tablet_ids: Vec<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionDesc {
    pub partition_id: i64,
    /// Empty means unbounded below.
    #[serde(default)]
    pub start_keys: Vec<PartitionKey>,
    /// Empty means unbounded above.
    #[serde(default)]
    pub end_keys: Vec<PartitionKey>,
    pub num_buckets: i32,
    pub indexes: Vec<PartitionIndexTablets>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TablePartitionParam {
    pub db_id: i64,
    pub table_id: i64,
    /// Range key columns; empty for an unpartitioned table.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Bucketing key columns; empty means round-robin bucketing.
    #[serde(default)]
    pub distributed_columns: Vec<String>,
    pub partitions: Vec<PartitionDesc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletLocation {
    pub tablet_id: i64,
    /// Replica placement; length equals the table's replication factor.
    pub node_ids: Vec<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableLocationParam {
    pub tablets: Vec<TabletLocation>,
}

impl TableLocationParam {
    pub fn find_tablet(&self, tablet_id: i64) -> Option<&TabletLocation> {
        self.tablets.iter().find(|loc| loc.tablet_id == tablet_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: i64,
    pub host: String,
    pub brpc_port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodesInfo {
    pub nodes: Vec<NodeInfo>,
}

impl NodesInfo {
    pub fn find_node(&self, id: i64) -> Option<&NodeInfo> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

/// Maps one destination column to an input column; the full expression engine
/// lives upstream, the sink only materializes column picks with an implicit
/// cast to the destination type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputColumnRef {
    pub input_column: usize,
}

/// The sink description record. One per load per sender, immutable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSinkParams {
    pub load_id: UniqueId,
    pub txn_id: i64,
    pub db_id: i64,
    pub table_id: i64,
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub table_name: String,
    pub tuple_desc_id: i32,
    pub num_replicas: i32,
    #[serde(default)]
    pub need_gen_rollup: bool,
    pub schema: TableSchemaParam,
    pub partition: TablePartitionParam,
    pub location: TableLocationParam,
    pub nodes_info: NodesInfo,
    #[serde(default)]
    pub load_channel_timeout_s: i64,
    #[serde(default)]
    pub load_mem_limit: i64,
    /// 0 disables the multi-threaded staging layer.
    #[serde(default)]
    pub buffer_num: i32,
    #[serde(default)]
    pub mem_limit_per_buf: i64,
    #[serde(default)]
    pub size_limit_per_buf: i64,
    #[serde(default)]
    pub rpc_timeout_ms: i32,
    /// Output projection for INSERT-style usage; absent for direct load.
    #[serde(default)]
    pub output_exprs: Option<Vec<OutputColumnRef>>,
}

impl TableSinkParams {
    pub fn from_json(blob: &str) -> Result<Self, SinkError> {
        let params: TableSinkParams = serde_json::from_str(blob)
            .map_err(|e| SinkError::InvalidConfig(format!("parse sink description: {e}")))?;
        params.validate()?;
        Ok(params)
    }

    /// Cross-field consistency checks the planner contract promises but a
    /// hand-built description may violate.
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.num_replicas <= 0 {
            return Err(SinkError::InvalidConfig(format!(
                "num_replicas must be positive, got {}",
                self.num_replicas
            )));
        }
        if self.schema.columns.is_empty() {
            return Err(SinkError::InvalidConfig(
                "schema has no columns".to_string(),
            ));
        }
        if self.schema.indexes.is_empty() {
            return Err(SinkError::InvalidConfig(
                "schema has no indexes".to_string(),
            ));
        }
        for index in &self.schema.indexes {
            if index.columns.is_empty() {
                return Err(SinkError::InvalidConfig(format!(
                    "index {} has no columns",
                    index.index_id
                )));
            }
            for col in &index.columns {
                let table_col = self
                    .schema
                    .columns
                    .iter()
                    .find(|c| c.name == col.name)
                    .ok_or_else(|| {
                        SinkError::InvalidConfig(format!(
                            "index {} column {} not found in table schema",
                            index.index_id, col.name
                        ))
                    })?;
                if table_col.column_type != col.column_type {
                    return Err(SinkError::InvalidConfig(format!(
                        "index {} column {} type {:?} differs from table type {:?}",
                        index.index_id, col.name, col.column_type, table_col.column_type
                    )));
                }
            }
        }
        if self.partition.partitions.is_empty() {
            return Err(SinkError::InvalidConfig(
                "partition param has no partitions".to_string(),
            ));
        }
        for col in &self.partition.partition_columns {
            if self.schema.column_index(col).is_none() {
                return Err(SinkError::InvalidConfig(format!(
                    "partition column {col} not found in schema"
                )));
            }
        }
        for col in &self.partition.distributed_columns {
            if self.schema.column_index(col).is_none() {
                return Err(SinkError::InvalidConfig(format!(
                    "distributed column {col} not found in schema"
                )));
            }
        }
        let mut tablet_owner: HashMap<i64, i64> = HashMap::new();
        for part in &self.partition.partitions {
            if part.num_buckets <= 0 {
                return Err(SinkError::InvalidConfig(format!(
                    "partition {} has non-positive bucket count {}",
                    part.partition_id, part.num_buckets
                )));
            }
            for index in &part.indexes {
                if self
                    .schema
                    .indexes
                    .iter()
                    .all(|schema_index| schema_index.index_id != index.index_id)
                {
                    return Err(SinkError::InvalidConfig(format!(
                        "partition {} references unknown index {}",
                        part.partition_id, index.index_id
                    )));
                }
                if index.tablet_ids.len() != part.num_buckets as usize {
                    return Err(SinkError::InvalidConfig(format!(
                        "partition {} index {} has {} tablets for {} buckets",
                        part.partition_id,
                        index.index_id,
                        index.tablet_ids.len(),
                        part.num_buckets
                    )));
                }
                for tablet_id in &index.tablet_ids {
                    if let Some(prev) = tablet_owner.insert(*tablet_id, part.partition_id) {
                        if prev != part.partition_id {
                            return Err(SinkError::InvalidConfig(format!(
                                "tablet {} appears in partitions {} and {}",
                                tablet_id, prev, part.partition_id
                            )));
                        }
                    }
                }
            }
            for schema_index in &self.schema.indexes {
                if part
                    .indexes
                    .iter()
                    .all(|index| index.index_id != schema_index.index_id)
                {
                    return Err(SinkError::InvalidConfig(format!(
                        "partition {} is missing tablets for index {}",
                        part.partition_id, schema_index.index_id
                    )));
                }
            }
        }
        for tablet_id in tablet_owner.keys() {
            let location = self.location.find_tablet(*tablet_id).ok_or_else(|| {
                SinkError::InvalidConfig(format!("tablet {tablet_id} has no location entry"))
            })?;
            if location.node_ids.len() != self.num_replicas as usize {
                return Err(SinkError::InvalidConfig(format!(
                    "tablet {} has {} replicas, expected {}",
                    tablet_id,
                    location.node_ids.len(),
                    self.num_replicas
                )));
            }
        }
        if let Some(output_exprs) = self.output_exprs.as_ref() {
            if output_exprs.len() != self.schema.columns.len() {
                return Err(SinkError::InvalidConfig(format!(
                    "output exprs count {} does not match destination column count {}",
                    output_exprs.len(),
                    self.schema.columns.len()
                )));
            }
        }
        Ok(())
    }
}
