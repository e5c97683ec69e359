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
//! Builders shared by the sink unit tests.
use std::sync::Arc;

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};

use crate::common::types::UniqueId;
use crate::exec::chunk::Chunk;
use crate::sink::descriptors::{
    ColumnDesc, ColumnType, IndexSchema, NodeInfo, NodesInfo, PartitionDesc, PartitionIndexTablets,
    PartitionKey, TableLocationParam, TablePartitionParam, TableSchemaParam, TableSinkParams,
    TabletLocation,
};

pub(crate) const TEST_INDEX_ID: i64 = 10;

pub(crate) fn test_schema() -> TableSchemaParam {
    let columns = vec![
        ColumnDesc {
            name: "k".to_string(),
            column_type: ColumnType::BigInt,
            is_nullable: false,
        },
        ColumnDesc {
            name: "v".to_string(),
            column_type: ColumnType::Varchar { len: 16 },
            is_nullable: true,
        },
    ];
    TableSchemaParam {
        db_id: 1,
        table_id: 2,
        columns: columns.clone(),
        indexes: vec![IndexSchema {
            index_id: TEST_INDEX_ID,
            schema_hash: 4242,
            columns,
        }],
    }
}

fn nodes_info(node_ids: &[i64]) -> NodesInfo {
    NodesInfo {
        nodes: node_ids
            .iter()
            .map(|id| NodeInfo {
                id: *id,
                host: "127.0.0.1".to_string(),
                brpc_port: 8060 + *id as u16,
            })
            .collect(),
    }
}

fn locations(partitions: &[PartitionDesc], node_ids: &[i64]) -> TableLocationParam {
    let mut tablets = Vec::new();
    for partition in partitions {
        for index in &partition.indexes {
            for tablet_id in &index.tablet_ids {
                tablets.push(TabletLocation {
                    tablet_id: *tablet_id,
                    node_ids: node_ids.to_vec(),
                });
            }
        }
    }
    TableLocationParam { tablets }
}

fn params_from_partitions(
    partitions: Vec<PartitionDesc>,
    node_ids: Vec<i64>,
) -> TableSinkParams {
    let location = locations(&partitions, &node_ids);
    TableSinkParams {
        load_id: UniqueId::new(7, 11),
        txn_id: 100,
        db_id: 1,
        table_id: 2,
        db_name: "db".to_string(),
        table_name: "tbl".to_string(),
        tuple_desc_id: 1,
        num_replicas: node_ids.len() as i32,
        need_gen_rollup: false,
        schema: test_schema(),
        partition: TablePartitionParam {
            db_id: 1,
            table_id: 2,
            partition_columns: vec!["k".to_string()],
            distributed_columns: vec!["k".to_string()],
            partitions,
        },
        location,
        nodes_info: nodes_info(&node_ids),
        load_channel_timeout_s: 60,
        load_mem_limit: 0,
        buffer_num: 0,
        mem_limit_per_buf: 0,
        size_limit_per_buf: 0,
        rpc_timeout_ms: 1000,
        output_exprs: None,
    }
}

fn partition_desc(
    partition_id: i64,
    tablet_base: i64,
    num_buckets: i32,
    start: Option<i64>,
    end: Option<i64>,
) -> PartitionDesc {
    PartitionDesc {
        partition_id,
        start_keys: start.map(|v| vec![PartitionKey::Int(v)]).unwrap_or_default(),
        end_keys: end.map(|v| vec![PartitionKey::Int(v)]).unwrap_or_default(),
        num_buckets,
        indexes: vec![PartitionIndexTablets {
            index_id: TEST_INDEX_ID,
            tablet_ids: (0..num_buckets as i64).map(|b| tablet_base + b).collect(),
        }],
    }
}

/// One open-bounds partition over one index.
pub(crate) fn one_index_params(num_buckets: i32, node_ids: Vec<i64>) -> TableSinkParams {
    let partitions = vec![partition_desc(11, 1000, num_buckets, None, None)];
    params_from_partitions(partitions, node_ids)
}

/// Two range partitions: keys in [min, 10) and [10, 20).
pub(crate) fn two_partition_params(num_buckets: i32, node_ids: Vec<i64>) -> TableSinkParams {
    let partitions = vec![
        partition_desc(11, 1000, num_buckets, None, Some(10)),
        partition_desc(12, 2000, num_buckets, Some(10), Some(20)),
    ];
    params_from_partitions(partitions, node_ids)
}

pub(crate) fn sink_chunk(keys: Vec<i64>, values: Vec<Option<&str>>) -> Chunk {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(StringArray::from(values)),
        ],
    )
    .expect("build sink chunk");
    Chunk::new(batch)
}

pub(crate) fn int_key_chunk(keys: Vec<i64>) -> Chunk {
    let values = (0..keys.len()).map(|i| Some(format!("r{i}"))).collect::<Vec<_>>();
    let values = values
        .iter()
        .map(|v| v.as_deref())
        .collect::<Vec<Option<&str>>>();
    sink_chunk(keys, values)
}
