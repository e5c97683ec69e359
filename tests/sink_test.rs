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
//! End-to-end sink tests against the in-process mock tablet-writer cluster.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Decimal128Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use tabletload::runtime::runtime_state::RuntimeState;
use tabletload::sink::descriptors::{ColumnDesc, ColumnType};
use tabletload::{Chunk, DataSink, SinkError, TabletSink};

mod common;

use common::{
    BASE_INDEX_ID, ChannelKey, MockCluster, ROLLUP_INDEX_ID, build_params, init_test_logging,
    int_chunk, open_partition, simple_params,
};

fn new_sink(cluster: &MockCluster, params: tabletload::TableSinkParams) -> TabletSink {
    let factory = cluster.stub_factory(&params.nodes_info);
    TabletSink::try_new(params, factory).expect("build sink")
}

fn run_load(
    sink: &mut TabletSink,
    state: &RuntimeState,
    chunks: Vec<Chunk>,
) -> Result<(), SinkError> {
    sink.prepare(state)?;
    sink.open(state)?;
    let mut send_status = Ok(());
    for chunk in &chunks {
        send_status = sink.send(state, chunk);
        if send_status.is_err() {
            break;
        }
    }
    sink.close(state, send_status)
}

#[test]
fn single_node_load_produces_contiguous_packets() {
    init_test_logging();
    let cluster = MockCluster::new();
    let params = simple_params(1, vec![1], 1);
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::new(None, 300, 0, 1);

    run_load(&mut sink, &state, vec![int_chunk((0..1000).collect())]).expect("load succeeds");

    let key = ChannelKey {
        node_id: 1,
        index_id: BASE_INDEX_ID,
        sender_id: 0,
    };
    let packets = cluster.packets(key);
    assert_eq!(
        packets.iter().map(|p| p.seq).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert_eq!(
        packets.iter().map(|p| p.num_rows).collect::<Vec<_>>(),
        vec![300, 300, 300, 100]
    );
    assert_eq!(
        packets.iter().map(|p| p.eos).collect::<Vec<_>>(),
        vec![false, false, false, true]
    );
    // The tail of the input lands in the eos packet.
    assert_eq!(packets[3].keys, (900..1000).collect::<Vec<i64>>());
    // The eos packet stages the written partitions for the coordinator.
    assert_eq!(packets[3].partition_ids, vec![11]);
    assert!(cluster.max_inflight(key) <= 1);

    let profile = sink.profile();
    assert_eq!(profile.counter_value("InputRows"), Some(1000));
    assert_eq!(profile.counter_value("OutputRows"), Some(1000));
    assert_eq!(profile.counter_value("FilteredRows"), Some(0));
}

#[test]
fn one_replica_failure_is_absorbed_by_quorum() {
    init_test_logging();
    let cluster = MockCluster::new();
    cluster.fail_add_batch_from(2, 2);
    let params = simple_params(2, vec![1, 2, 3], 3);
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::new(None, 10, 0, 1);

    run_load(&mut sink, &state, vec![int_chunk((0..100).collect())])
        .expect("load survives one failed replica");

    for node_id in [1, 3] {
        let key = ChannelKey {
            node_id,
            index_id: BASE_INDEX_ID,
            sender_id: 0,
        };
        let packets = cluster.packets(key);
        assert!(!packets.is_empty(), "live node {node_id} got packets");
        let seqs: Vec<i64> = packets.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, (0..packets.len() as i64).collect::<Vec<_>>());
        assert!(packets.last().expect("packets").eos);
        assert_eq!(
            cluster.received_keys(key).len(),
            100,
            "live replicas keep the full row set"
        );
    }
}

#[test]
fn losing_two_of_three_replicas_fails_the_load() {
    init_test_logging();
    let cluster = MockCluster::new();
    cluster.fail_add_batch_from(1, 0);
    cluster.fail_add_batch_from(2, 0);
    let params = simple_params(2, vec![1, 2, 3], 3);
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::new(None, 10, 0, 1);

    let err = run_load(&mut sink, &state, vec![int_chunk((0..100).collect())])
        .expect_err("load must fail after losing the quorum");
    assert!(matches!(err, SinkError::QuorumLost(_)), "err={err}");

    let cancelled: HashSet<i64> = cluster
        .cancelled_nodes()
        .into_iter()
        .map(|(node_id, _)| node_id)
        .collect();
    assert!(
        cancelled.contains(&3),
        "the surviving replica is cancelled, got {cancelled:?}"
    );
}

#[test]
fn row_fans_out_to_every_replica_of_every_index() {
    init_test_logging();
    let cluster = MockCluster::new();
    let params = build_params(common::ParamsSpec {
        partitions: vec![open_partition(
            11,
            1000,
            1,
            &[BASE_INDEX_ID, ROLLUP_INDEX_ID],
        )],
        index_ids: vec![BASE_INDEX_ID, ROLLUP_INDEX_ID],
        node_ids: vec![1, 2],
        num_replicas: 2,
        buffer_num: 0,
    });
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::default();

    run_load(&mut sink, &state, vec![int_chunk(vec![42])]).expect("load succeeds");

    for index_id in [BASE_INDEX_ID, ROLLUP_INDEX_ID] {
        for node_id in [1, 2] {
            let key = ChannelKey {
                node_id,
                index_id,
                sender_id: 0,
            };
            assert_eq!(
                cluster.received_keys(key),
                vec![42],
                "index {index_id} node {node_id} must hold the row"
            );
        }
    }
    // Base and rollup route the row to their own tablets, and the rollup
    // batches are narrowed to the rollup's column set.
    let base_key = ChannelKey {
        node_id: 1,
        index_id: BASE_INDEX_ID,
        sender_id: 0,
    };
    let rollup_key = ChannelKey {
        node_id: 1,
        index_id: ROLLUP_INDEX_ID,
        sender_id: 0,
    };
    assert_eq!(cluster.packets(base_key)[0].tablet_ids, vec![1000]);
    assert_eq!(cluster.packets(rollup_key)[0].tablet_ids, vec![1500]);
    assert_eq!(cluster.packets(base_key)[0].num_columns, 2);
    assert_eq!(cluster.packets(rollup_key)[0].num_columns, 1);
}

#[test]
fn multi_threaded_load_neither_drops_nor_duplicates_rows() {
    init_test_logging();
    let cluster = MockCluster::new();
    let node_ids: Vec<i64> = (1..=8).collect();
    let mut params = build_params(common::ParamsSpec {
        partitions: vec![open_partition(11, 1000, 8, &[BASE_INDEX_ID])],
        index_ids: vec![BASE_INDEX_ID],
        node_ids: node_ids.clone(),
        num_replicas: 1,
        buffer_num: 4,
    });
    params.size_limit_per_buf = 64;
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::new(None, 1024, 0, 1);

    let chunks: Vec<Chunk> = (0..10)
        .map(|i| int_chunk((i * 10_000..(i + 1) * 10_000).collect()))
        .collect();
    run_load(&mut sink, &state, chunks).expect("multi-threaded load succeeds");

    let mut all_keys = Vec::new();
    for key in cluster.channel_keys() {
        let packets = cluster.packets(key);
        if packets.is_empty() {
            continue;
        }
        let seqs: Vec<i64> = packets.iter().map(|p| p.seq).collect();
        assert_eq!(
            seqs,
            (0..packets.len() as i64).collect::<Vec<_>>(),
            "channel {key:?} sequence must be contiguous"
        );
        assert_eq!(
            packets.iter().filter(|p| p.eos).count(),
            1,
            "channel {key:?} must see exactly one eos"
        );
        assert!(packets.last().expect("packets").eos);
        assert!(cluster.max_inflight(key) <= 1);
        all_keys.extend(cluster.received_keys(key));
    }
    assert_eq!(all_keys.len(), 100_000, "no row lost or duplicated");
    let distinct: HashSet<i64> = all_keys.into_iter().collect();
    assert_eq!(distinct.len(), 100_000);
}

#[test]
fn invalid_decimal_row_is_filtered_not_fatal() {
    init_test_logging();
    let cluster = MockCluster::new();
    let mut params = simple_params(1, vec![1], 1);
    params.schema.columns = vec![
        ColumnDesc {
            name: "k".to_string(),
            column_type: ColumnType::BigInt,
            is_nullable: false,
        },
        ColumnDesc {
            name: "d".to_string(),
            column_type: ColumnType::Decimal {
                precision: 4,
                scale: 2,
            },
            is_nullable: true,
        },
    ];
    let table_columns = params.schema.columns.clone();
    for index in &mut params.schema.indexes {
        index.columns = table_columns.clone();
    }
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::default();

    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("d", DataType::Decimal128(4, 2), true),
    ]));
    let decimals = Decimal128Array::from(vec![1234_i128, 99999_i128, -42_i128])
        .with_precision_and_scale(4, 2)
        .expect("decimal array");
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(decimals),
        ],
    )
    .expect("batch");

    run_load(&mut sink, &state, vec![Chunk::new(batch)]).expect("filtered row is not an error");

    let profile = sink.profile();
    assert_eq!(profile.counter_value("InputRows"), Some(3));
    assert_eq!(profile.counter_value("OutputRows"), Some(2));
    assert_eq!(profile.counter_value("FilteredRows"), Some(1));

    let key = ChannelKey {
        node_id: 1,
        index_id: BASE_INDEX_ID,
        sender_id: 0,
    };
    let keys = cluster.received_keys(key);
    assert_eq!(keys, vec![1, 3], "the overflow row stays out of the batches");
}

#[test]
fn rows_outside_every_partition_are_filtered() {
    init_test_logging();
    let cluster = MockCluster::new();
    let params = build_params(common::ParamsSpec {
        partitions: vec![
            common::range_partition(11, 1000, 2, None, Some(10), &[BASE_INDEX_ID]),
            common::range_partition(12, 2000, 2, Some(10), Some(20), &[BASE_INDEX_ID]),
        ],
        index_ids: vec![BASE_INDEX_ID],
        node_ids: vec![1],
        num_replicas: 1,
        buffer_num: 0,
    });
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::default();

    run_load(&mut sink, &state, vec![int_chunk(vec![5, 15, 99])]).expect("load succeeds");

    let profile = sink.profile();
    assert_eq!(profile.counter_value("InputRows"), Some(3));
    assert_eq!(profile.counter_value("OutputRows"), Some(2));
    assert_eq!(profile.counter_value("FilteredRows"), Some(1));

    let key = ChannelKey {
        node_id: 1,
        index_id: BASE_INDEX_ID,
        sender_id: 0,
    };
    // Both partitions were written, and are staged on the eos packet.
    let eos = cluster
        .packets(key)
        .into_iter()
        .find(|p| p.eos)
        .expect("eos packet");
    assert_eq!(eos.partition_ids, vec![11, 12]);
}

#[test]
fn open_failure_on_one_replica_is_survivable() {
    init_test_logging();
    let cluster = MockCluster::new();
    cluster.fail_open(2);
    let params = simple_params(2, vec![1, 2, 3], 3);
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::new(None, 10, 0, 1);

    run_load(&mut sink, &state, vec![int_chunk((0..40).collect())])
        .expect("open failure within quorum is tolerated");

    let failed_key = ChannelKey {
        node_id: 2,
        index_id: BASE_INDEX_ID,
        sender_id: 0,
    };
    assert!(
        cluster.packets(failed_key).is_empty(),
        "failed node receives no batches"
    );
    for node_id in [1, 3] {
        let key = ChannelKey {
            node_id,
            index_id: BASE_INDEX_ID,
            sender_id: 0,
        };
        assert_eq!(cluster.received_keys(key).len(), 40);
    }
}

#[test]
fn unknown_node_in_location_fails_open() {
    init_test_logging();
    let cluster = MockCluster::new();
    let mut params = simple_params(1, vec![1], 1);
    params.nodes_info.nodes.clear();
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::default();

    sink.prepare(&state).expect("prepare");
    let err = sink.open(&state).expect_err("open must fail");
    assert!(matches!(err, SinkError::UnknownNode(1)), "err={err}");
    let _ = sink.close(&state, Err(err));
}

#[test]
fn cancelled_state_short_circuits_close_to_cancel() {
    init_test_logging();
    let cluster = MockCluster::new();
    let params = simple_params(1, vec![1], 1);
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::default();

    sink.prepare(&state).expect("prepare");
    sink.open(&state).expect("open");
    sink.send(&state, &int_chunk(vec![1, 2, 3])).expect("send");
    state.cancel();
    let err = sink.close(&state, Ok(())).expect_err("close must cancel");
    assert!(matches!(err, SinkError::Cancelled(_)), "err={err}");
    assert!(
        cluster
            .cancelled_nodes()
            .iter()
            .any(|(node_id, _)| *node_id == 1),
        "remote writer got the cancel rpc"
    );
}

#[test]
fn two_senders_write_independent_packet_sequences() {
    init_test_logging();
    let cluster = MockCluster::new();
    let params = simple_params(2, vec![1], 1);

    for sender_id in [0, 1] {
        let mut sink = new_sink(&cluster, params.clone());
        let state = RuntimeState::new(None, 16, sender_id, 2);
        run_load(
            &mut sink,
            &state,
            vec![int_chunk((0..50).map(|k| k + 100 * sender_id as i64).collect())],
        )
        .expect("sender load succeeds");
    }

    for sender_id in [0, 1] {
        let key = ChannelKey {
            node_id: 1,
            index_id: BASE_INDEX_ID,
            sender_id,
        };
        let packets = cluster.packets(key);
        assert!(!packets.is_empty(), "sender {sender_id} wrote packets");
        let seqs: Vec<i64> = packets.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, (0..packets.len() as i64).collect::<Vec<_>>());
        assert_eq!(cluster.received_keys(key).len(), 50);
    }
}

#[test]
fn slow_receiver_backpressure_keeps_buffer_memory_bounded() {
    init_test_logging();
    let cluster = MockCluster::new();
    cluster.delay_per_packet(1, Duration::from_millis(5));
    let mut params = simple_params(1, vec![1], 1);
    params.buffer_num = 1;
    params.size_limit_per_buf = 4;
    params.mem_limit_per_buf = 4 * 1024 * 1024;
    let buffer_limit = params.mem_limit_per_buf;
    let mut sink = new_sink(&cluster, params);
    let state = RuntimeState::new(None, 64, 0, 1);

    let chunks: Vec<Chunk> = (0..20)
        .map(|i| int_chunk((i * 256..(i + 1) * 256).collect()))
        .collect();
    run_load(&mut sink, &state, chunks).expect("slow receiver load succeeds");

    let key = ChannelKey {
        node_id: 1,
        index_id: BASE_INDEX_ID,
        sender_id: 0,
    };
    assert!(cluster.max_inflight(key) <= 1, "one packet in flight at most");
    assert_eq!(cluster.received_keys(key).len(), 20 * 256);

    // The buffer tracker is published into the profile at close; its peak
    // must stay under the configured byte limit.
    let mem_root = sink
        .profile()
        .get_child("MemTracker")
        .expect("mem tracker tree");
    let buffer_profile = mem_root
        .get_child("RowBuffer-0")
        .expect("row buffer tracker");
    let peak = buffer_profile
        .counter_value("PeakMemoryBytes")
        .expect("peak counter");
    assert!(
        peak <= buffer_limit,
        "buffer peak {peak} must stay under limit {buffer_limit}"
    );
}
