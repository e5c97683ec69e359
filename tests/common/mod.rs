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
//! Shared fixtures: an in-process mock of the tablet-writer cluster plus
//! sink description builders.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};

use tabletload::Chunk;
use tabletload::UniqueId;
use tabletload::exec::chunk::decode_batches;
use tabletload::service::tablet_writer::proto::{
    PStatus, PTabletInfo, PTabletWriterAddBatchRequest, PTabletWriterAddBatchResult,
    PTabletWriterCancelRequest, PTabletWriterCancelResult, PTabletWriterOpenRequest,
    PTabletWriterOpenResult,
};
use tabletload::service::tablet_writer::{PendingRpc, TabletWriterStub, TabletWriterStubFactory};
use tabletload::sink::descriptors::{
    ColumnDesc, ColumnType, IndexSchema, NodeInfo, NodesInfo, PartitionDesc,
    PartitionIndexTablets, PartitionKey, TableLocationParam, TablePartitionParam,
    TableSchemaParam, TableSinkParams, TabletLocation,
};

pub const BASE_INDEX_ID: i64 = 10;
pub const ROLLUP_INDEX_ID: i64 = 20;
const BASE_PORT: u16 = 18060;

/// One tablets-channel session as the mock receiver observed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub node_id: i64,
    pub index_id: i64,
    pub sender_id: i32,
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub seq: i64,
    pub num_rows: usize,
    pub num_columns: usize,
    pub tablet_ids: Vec<i64>,
    pub keys: Vec<i64>,
    pub eos: bool,
    pub partition_ids: Vec<i64>,
}

#[derive(Default)]
pub struct ChannelRecord {
    pub opened: bool,
    pub packets: Vec<Packet>,
    inflight: usize,
    pub max_inflight: usize,
}

#[derive(Default)]
struct ClusterState {
    records: Mutex<HashMap<ChannelKey, ChannelRecord>>,
    cancels: Mutex<Vec<(i64, i64)>>,
    fail_open_nodes: Mutex<HashSet<i64>>,
    // node -> first packet_seq the node rejects
    fail_add_batch_from: Mutex<HashMap<i64, i64>>,
    delay_per_packet: Mutex<HashMap<i64, Duration>>,
}

/// In-process tablet-writer cluster. One stub per node; every request is
/// served on a worker thread so in-flight accounting is observable.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<ClusterState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, node_id: i64) {
        self.state
            .fail_open_nodes
            .lock()
            .unwrap()
            .insert(node_id);
    }

    /// Reject every add-batch of `node_id` whose packet_seq >= `from_seq`.
    pub fn fail_add_batch_from(&self, node_id: i64, from_seq: i64) {
        self.state
            .fail_add_batch_from
            .lock()
            .unwrap()
            .insert(node_id, from_seq);
    }

    pub fn delay_per_packet(&self, node_id: i64, delay: Duration) {
        self.state
            .delay_per_packet
            .lock()
            .unwrap()
            .insert(node_id, delay);
    }

    pub fn cancelled_nodes(&self) -> Vec<(i64, i64)> {
        self.state.cancels.lock().unwrap().clone()
    }

    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> =
            self.state.records.lock().unwrap().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn packets(&self, key: ChannelKey) -> Vec<Packet> {
        self.state
            .records
            .lock()
            .unwrap()
            .get(&key)
            .map(|rec| rec.packets.clone())
            .unwrap_or_default()
    }

    pub fn max_inflight(&self, key: ChannelKey) -> usize {
        self.state
            .records
            .lock()
            .unwrap()
            .get(&key)
            .map(|rec| rec.max_inflight)
            .unwrap_or(0)
    }

    pub fn was_opened(&self, key: ChannelKey) -> bool {
        self.state
            .records
            .lock()
            .unwrap()
            .get(&key)
            .map(|rec| rec.opened)
            .unwrap_or(false)
    }

    /// Every key (value of the `k` column) this channel received, in packet
    /// order.
    pub fn received_keys(&self, key: ChannelKey) -> Vec<i64> {
        self.packets(key)
            .iter()
            .flat_map(|p| p.keys.iter().copied())
            .collect()
    }

    pub fn stub_factory(&self, nodes_info: &NodesInfo) -> Arc<dyn TabletWriterStubFactory> {
        let port_to_node = nodes_info
            .nodes
            .iter()
            .map(|node| (node.brpc_port, node.id))
            .collect();
        Arc::new(MockStubFactory {
            cluster: self.clone(),
            port_to_node,
        })
    }

    fn on_open(&self, node_id: i64, request: PTabletWriterOpenRequest) -> PTabletWriterOpenResult {
        let sender_failed = self.state.fail_open_nodes.lock().unwrap().contains(&node_id);
        let key = ChannelKey {
            node_id,
            index_id: request.index_id,
            // The open request carries no sender id; record under sender 0.
            sender_id: 0,
        };
        let mut records = self.state.records.lock().unwrap();
        records.entry(key).or_default().opened = true;
        drop(records);
        PTabletWriterOpenResult {
            status: Some(if sender_failed {
                error_status("open rejected by mock")
            } else {
                ok_status()
            }),
        }
    }

    fn on_add_batch(
        &self,
        node_id: i64,
        request: PTabletWriterAddBatchRequest,
    ) -> PTabletWriterAddBatchResult {
        let fail_from = self
            .state
            .fail_add_batch_from
            .lock()
            .unwrap()
            .get(&node_id)
            .copied();

        let batches = decode_batches(&request.row_batch).expect("decode mock row batch");
        let num_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        let num_columns = batches.first().map(|b| b.num_columns()).unwrap_or(0);
        assert_eq!(
            request.tablet_ids.len(),
            num_rows,
            "tablet id vector must parallel the rows"
        );
        let keys = batches.iter().flat_map(batch_keys).collect();

        let key = ChannelKey {
            node_id,
            index_id: request.index_id,
            sender_id: request.sender_id,
        };
        let mut records = self.state.records.lock().unwrap();
        let record = records.entry(key).or_default();
        record.packets.push(Packet {
            seq: request.packet_seq,
            num_rows,
            num_columns,
            tablet_ids: request.tablet_ids.clone(),
            keys,
            eos: request.eos,
            partition_ids: request.partition_ids.clone(),
        });

        if let Some(from) = fail_from {
            if request.packet_seq >= from {
                return PTabletWriterAddBatchResult {
                    status: Some(error_status("add batch rejected by mock")),
                    tablet_vec: Vec::new(),
                    execution_time_us: 1,
                    wait_lock_time_us: 0,
                };
            }
        }

        let tablet_vec = if request.eos {
            let mut seen: Vec<i64> = record
                .packets
                .iter()
                .flat_map(|p| p.tablet_ids.iter().copied())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            seen.sort_unstable();
            seen.into_iter()
                .map(|tablet_id| PTabletInfo {
                    tablet_id,
                    schema_hash: 0,
                })
                .collect()
        } else {
            Vec::new()
        };
        PTabletWriterAddBatchResult {
            status: Some(ok_status()),
            tablet_vec,
            execution_time_us: 1,
            wait_lock_time_us: 0,
        }
    }

    fn on_cancel(&self, node_id: i64, request: PTabletWriterCancelRequest) {
        self.state
            .cancels
            .lock()
            .unwrap()
            .push((node_id, request.index_id));
    }

    fn track_dispatch(&self, key: ChannelKey) {
        let mut records = self.state.records.lock().unwrap();
        let record = records.entry(key).or_default();
        record.inflight += 1;
        record.max_inflight = record.max_inflight.max(record.inflight);
    }

    fn track_complete(&self, key: ChannelKey) {
        let mut records = self.state.records.lock().unwrap();
        if let Some(record) = records.get_mut(&key) {
            record.inflight = record.inflight.saturating_sub(1);
        }
    }
}

fn batch_keys(batch: &RecordBatch) -> Vec<i64> {
    let Some(column) = batch.column_by_name("k") else {
        return Vec::new();
    };
    let Some(typed) = column.as_any().downcast_ref::<Int64Array>() else {
        return Vec::new();
    };
    (0..typed.len())
        .map(|i| if typed.is_null(i) { i64::MIN } else { typed.value(i) })
        .collect()
}

fn ok_status() -> PStatus {
    PStatus {
        status_code: 0,
        error_msgs: Vec::new(),
    }
}

fn error_status(msg: &str) -> PStatus {
    PStatus {
        status_code: 1,
        error_msgs: vec![msg.to_string()],
    }
}

struct MockStubFactory {
    cluster: MockCluster,
    port_to_node: HashMap<u16, i64>,
}

impl TabletWriterStubFactory for MockStubFactory {
    fn create(
        &self,
        _host: &str,
        port: u16,
    ) -> Result<Arc<dyn TabletWriterStub>, String> {
        let node_id = self
            .port_to_node
            .get(&port)
            .copied()
            .ok_or_else(|| format!("no mock node listens on port {port}"))?;
        Ok(Arc::new(MockStub {
            cluster: self.cluster.clone(),
            node_id,
        }))
    }
}

struct MockStub {
    cluster: MockCluster,
    node_id: i64,
}

impl TabletWriterStub for MockStub {
    fn tablet_writer_open(
        &self,
        request: PTabletWriterOpenRequest,
    ) -> PendingRpc<PTabletWriterOpenResult> {
        let cluster = self.cluster.clone();
        let node_id = self.node_id;
        let (tx, pending) = PendingRpc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(Ok(cluster.on_open(node_id, request)));
        });
        pending
    }

    fn tablet_writer_add_batch(
        &self,
        request: PTabletWriterAddBatchRequest,
    ) -> PendingRpc<PTabletWriterAddBatchResult> {
        let cluster = self.cluster.clone();
        let node_id = self.node_id;
        let key = ChannelKey {
            node_id,
            index_id: request.index_id,
            sender_id: request.sender_id,
        };
        cluster.track_dispatch(key);
        let delay = cluster
            .state
            .delay_per_packet
            .lock()
            .unwrap()
            .get(&node_id)
            .copied();
        let (tx, pending) = PendingRpc::channel();
        std::thread::spawn(move || {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            let result = cluster.on_add_batch(node_id, request);
            cluster.track_complete(key);
            let _ = tx.send(Ok(result));
        });
        pending
    }

    fn tablet_writer_cancel(
        &self,
        request: PTabletWriterCancelRequest,
    ) -> PendingRpc<PTabletWriterCancelResult> {
        // Recorded synchronously so tests can assert right after close.
        self.cluster.on_cancel(self.node_id, request);
        PendingRpc::ready(Ok(PTabletWriterCancelResult {
            status: Some(ok_status()),
        }))
    }
}

/// Poisoned stub factory used to assert UnknownNode handling.
pub struct RejectingStubFactory;

impl TabletWriterStubFactory for RejectingStubFactory {
    fn create(&self, _host: &str, _port: u16) -> Result<Arc<dyn TabletWriterStub>, String> {
        Err("factory rejects every endpoint".to_string())
    }
}

// ---------------------------------------------------------------------------
// Sink description builders
// ---------------------------------------------------------------------------

pub fn node_port(node_id: i64) -> u16 {
    BASE_PORT + node_id as u16
}

pub fn nodes_info(node_ids: &[i64]) -> NodesInfo {
    NodesInfo {
        nodes: node_ids
            .iter()
            .map(|id| NodeInfo {
                id: *id,
                host: "127.0.0.1".to_string(),
                brpc_port: node_port(*id),
            })
            .collect(),
    }
}

pub fn bigint_varchar_schema(index_ids: &[i64]) -> TableSchemaParam {
    let key_column = ColumnDesc {
        name: "k".to_string(),
        column_type: ColumnType::BigInt,
        is_nullable: false,
    };
    let value_column = ColumnDesc {
        name: "v".to_string(),
        column_type: ColumnType::Varchar { len: 32 },
        is_nullable: true,
    };
    TableSchemaParam {
        db_id: 1,
        table_id: 2,
        columns: vec![key_column.clone(), value_column.clone()],
        indexes: index_ids
            .iter()
            .map(|index_id| IndexSchema {
                index_id: *index_id,
                schema_hash: 4242 + *index_id as i32,
                // The base index stores the full tuple; rollups keep only the
                // key column.
                columns: if *index_id == BASE_INDEX_ID {
                    vec![key_column.clone(), value_column.clone()]
                } else {
                    vec![key_column.clone()]
                },
            })
            .collect(),
    }
}

/// One open-bounds partition whose tablets are `tablet_base + bucket` for the
/// base index and `tablet_base + 500 + bucket` for every further index.
pub fn open_partition(partition_id: i64, tablet_base: i64, num_buckets: i32, index_ids: &[i64]) -> PartitionDesc {
    PartitionDesc {
        partition_id,
        start_keys: Vec::new(),
        end_keys: Vec::new(),
        num_buckets,
        indexes: index_ids
            .iter()
            .enumerate()
            .map(|(i, index_id)| PartitionIndexTablets {
                index_id: *index_id,
                tablet_ids: (0..num_buckets as i64)
                    .map(|b| tablet_base + 500 * i as i64 + b)
                    .collect(),
            })
            .collect(),
    }
}

pub fn range_partition(
    partition_id: i64,
    tablet_base: i64,
    num_buckets: i32,
    start: Option<i64>,
    end: Option<i64>,
    index_ids: &[i64],
) -> PartitionDesc {
    let mut partition = open_partition(partition_id, tablet_base, num_buckets, index_ids);
    partition.start_keys = start.map(|v| vec![PartitionKey::Int(v)]).unwrap_or_default();
    partition.end_keys = end.map(|v| vec![PartitionKey::Int(v)]).unwrap_or_default();
    partition
}

/// Replicate every tablet onto `num_replicas` nodes, cycling through
/// `node_ids` so load spreads: tablet ordinal j lands on nodes
/// j, j+1, ... (mod node count).
pub fn cycled_locations(
    partitions: &[PartitionDesc],
    node_ids: &[i64],
    num_replicas: usize,
) -> TableLocationParam {
    let mut tablets = Vec::new();
    let mut ordinal = 0usize;
    for partition in partitions {
        for index in &partition.indexes {
            for tablet_id in &index.tablet_ids {
                let replicas = (0..num_replicas)
                    .map(|r| node_ids[(ordinal + r) % node_ids.len()])
                    .collect();
                tablets.push(TabletLocation {
                    tablet_id: *tablet_id,
                    node_ids: replicas,
                });
                ordinal += 1;
            }
        }
    }
    TableLocationParam { tablets }
}

pub struct ParamsSpec {
    pub partitions: Vec<PartitionDesc>,
    pub index_ids: Vec<i64>,
    pub node_ids: Vec<i64>,
    pub num_replicas: usize,
    pub buffer_num: i32,
}

pub fn build_params(spec: ParamsSpec) -> TableSinkParams {
    let location = cycled_locations(&spec.partitions, &spec.node_ids, spec.num_replicas);
    TableSinkParams {
        load_id: UniqueId::new(7, 11),
        txn_id: 100,
        db_id: 1,
        table_id: 2,
        db_name: "db".to_string(),
        table_name: "tbl".to_string(),
        tuple_desc_id: 1,
        num_replicas: spec.num_replicas as i32,
        need_gen_rollup: false,
        schema: bigint_varchar_schema(&spec.index_ids),
        partition: TablePartitionParam {
            db_id: 1,
            table_id: 2,
            partition_columns: vec!["k".to_string()],
            distributed_columns: vec!["k".to_string()],
            partitions: spec.partitions,
        },
        location,
        nodes_info: nodes_info(&spec.node_ids),
        load_channel_timeout_s: 60,
        load_mem_limit: 0,
        buffer_num: spec.buffer_num,
        mem_limit_per_buf: 0,
        size_limit_per_buf: 0,
        rpc_timeout_ms: 5_000,
        output_exprs: None,
    }
}

/// Single partition, single index over the given nodes.
pub fn simple_params(num_buckets: i32, node_ids: Vec<i64>, num_replicas: usize) -> TableSinkParams {
    build_params(ParamsSpec {
        partitions: vec![open_partition(11, 1000, num_buckets, &[BASE_INDEX_ID])],
        index_ids: vec![BASE_INDEX_ID],
        node_ids,
        num_replicas,
        buffer_num: 0,
    })
}

pub fn sink_chunk(keys: Vec<i64>, values: Vec<Option<&str>>) -> Chunk {
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

pub fn int_chunk(keys: Vec<i64>) -> Chunk {
    let values: Vec<String> = (0..keys.len()).map(|i| format!("r{i}")).collect();
    let values: Vec<Option<&str>> = values.iter().map(|v| Some(v.as_str())).collect();
    sink_chunk(keys, values)
}

/// Guards against double logging init across test binaries.
static LOGGING: AtomicBool = AtomicBool::new(false);

pub fn init_test_logging() {
    if !LOGGING.swap(true, Ordering::SeqCst) {
        tabletload::tabletload_logging::init_with_level("warn");
    }
}
