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
//! One RPC session to one backend node for one index.
//!
//! The channel accumulates the rows of every tablet hosted on its node into a
//! node-local batch and ships the batch with at most one request in flight.
//! Waiting on the previous packet before the next send is the sink's
//! backpressure point; the per-(sender, index, node) packet sequence it
//! produces is strictly monotone and gap-free, ending in one eos packet.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use arrow::array::RecordBatch;

use crate::exec::chunk::record_batch_bytes;
use crate::runtime::profile::clamp_u128_to_i64;
use crate::service::tablet_writer::proto::{
    PTabletInfo, PTabletWithPartition, PTabletWriterAddBatchRequest, PTabletWriterAddBatchResult,
    PTabletWriterCancelRequest, PTabletWriterOpenRequest, PTabletWriterOpenResult, PUniqueId,
};
use crate::service::tablet_writer::{
    PendingRpc, RpcError, TabletWriterStub, status_code, status_message,
};
use crate::sink::context::{IndexTupleSchema, SinkContext};
use crate::sink::error::{SinkError, SinkResult};
use crate::tabletload_logging::{debug, warn};

/// The counters of the add-batch rpcs of a single node.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddBatchCounter {
    pub add_batch_execution_time_us: i64,
    pub add_batch_wait_lock_time_us: i64,
    pub add_batch_num: i64,
}

impl std::ops::AddAssign for AddBatchCounter {
    fn add_assign(&mut self, rhs: Self) {
        self.add_batch_execution_time_us += rhs.add_batch_execution_time_us;
        self.add_batch_wait_lock_time_us += rhs.add_batch_wait_lock_time_us;
        self.add_batch_num += rhs.add_batch_num;
    }
}

struct ChannelInner {
    stub: Option<Arc<dyn TabletWriterStub>>,
    open_rpc: Option<PendingRpc<PTabletWriterOpenResult>>,
    in_flight: Option<PendingRpc<PTabletWriterAddBatchResult>>,
    next_packet_seq: i64,
    batch: Vec<RecordBatch>,
    batch_rows: usize,
    batch_bytes: usize,
    tablet_ids: Vec<i64>,
    eos_sent: bool,
    tablet_infos: Vec<PTabletInfo>,
    serialize_batch_ns: u128,
    wait_in_flight_packet_ns: u128,
    add_batch_counter: AddBatchCounter,
}

pub struct NodeChannel {
    ctx: Arc<SinkContext>,
    index_id: i64,
    node_id: i64,
    schema_hash: i32,
    tuple: Arc<IndexTupleSchema>,
    host: String,
    port: u16,
    all_tablets: Vec<PTabletWithPartition>,
    failed: AtomicBool,
    inner: Mutex<ChannelInner>,
}

impl NodeChannel {
    pub fn new(
        ctx: Arc<SinkContext>,
        index_id: i64,
        schema_hash: i32,
        tuple: Arc<IndexTupleSchema>,
        node_id: i64,
    ) -> Self {
        Self {
            ctx,
            index_id,
            node_id,
            schema_hash,
            tuple,
            host: String::new(),
            port: 0,
            all_tablets: Vec::new(),
            failed: AtomicBool::new(false),
            inner: Mutex::new(ChannelInner {
                stub: None,
                open_rpc: None,
                in_flight: None,
                next_packet_seq: 0,
                batch: Vec::new(),
                batch_rows: 0,
                batch_bytes: 0,
                tablet_ids: Vec::new(),
                eos_sent: false,
                tablet_infos: Vec::new(),
                serialize_batch_ns: 0,
                wait_in_flight_packet_ns: 0,
                add_batch_counter: AddBatchCounter::default(),
            }),
        }
    }

    /// Register a tablet hosted on this node. Pre-open only; the set is
    /// frozen once init runs.
    pub fn add_tablet(&mut self, partition_id: i64, tablet_id: i64) {
        self.all_tablets.push(PTabletWithPartition {
            partition_id,
            tablet_id,
        });
    }

    /// Resolve the node endpoint and build the RPC stub.
    pub fn init(&mut self) -> SinkResult<()> {
        let node = self
            .ctx
            .nodes_info
            .find_node(self.node_id)
            .ok_or(SinkError::UnknownNode(self.node_id))?;
        self.host = node.host.clone();
        self.port = node.brpc_port;
        let stub = self
            .ctx
            .stub_factory
            .create(&node.host, node.brpc_port)
            .map_err(|e| {
                SinkError::OpenRpcFailed(format!(
                    "create stub for node {} failed: {e}",
                    self.node_id
                ))
            })?;
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).stub = Some(stub);
        Ok(())
    }

    pub fn index_id(&self) -> i64 {
        self.index_id
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn load_id_info(&self) -> String {
        format!(
            "{}, index_id={}, node={}({}:{})",
            self.ctx.load_id_info(),
            self.index_id,
            self.node_id,
            self.host,
            self.port
        )
    }

    /// Dispatch the asynchronous open RPC; `open_wait` collects its result.
    pub fn open(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stub) = inner.stub.as_ref().map(Arc::clone) else {
            return;
        };
        let request = PTabletWriterOpenRequest {
            id: Some(PUniqueId {
                hi: self.ctx.load_id.hi,
                lo: self.ctx.load_id.lo,
            }),
            index_id: self.index_id,
            txn_id: self.ctx.txn_id,
            schema_hash: self.schema_hash,
            tuple_schema: self.tuple.schema_ipc.clone(),
            tablets: self.all_tablets.clone(),
            num_senders: self.ctx.num_senders,
            need_gen_rollup: self.ctx.need_gen_rollup,
            load_mem_limit: self.ctx.load_mem_limit,
            load_channel_timeout_s: self.ctx.load_channel_timeout_s,
        };
        debug!(
            "open node channel: {}, tablets={}",
            self.load_id_info(),
            self.all_tablets.len()
        );
        inner.open_rpc = Some(stub.tablet_writer_open(request));
    }

    /// Block until the open RPC completes.
    pub fn open_wait(&self) -> SinkResult<()> {
        let rpc = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.open_rpc.take()
        };
        let Some(rpc) = rpc else {
            return Err(SinkError::Internal(format!(
                "open_wait without open: {}",
                self.load_id_info()
            )));
        };
        let result = rpc.wait(self.ctx.rpc_timeout).map_err(|e| match e {
            RpcError::Timeout(t) => SinkError::OpenRpcFailed(format!(
                "open rpc timed out after {t:?}: {}",
                self.load_id_info()
            )),
            RpcError::Transport(msg) => {
                SinkError::OpenRpcFailed(format!("{msg}: {}", self.load_id_info()))
            }
        })?;
        if status_code(result.status.as_ref()) != 0 {
            return Err(SinkError::RemoteRejected(format!(
                "{}: {}",
                status_message(result.status.as_ref()),
                self.load_id_info()
            )));
        }
        Ok(())
    }

    /// Append rows destined for `tablet_id`. Seals and sends the accumulated
    /// batch whenever the row or byte cap is reached, blocking on the
    /// previous in-flight packet first.
    pub fn add_rows(&self, rows: RecordBatch, tablet_id: i64) -> SinkResult<()> {
        if self.is_failed() {
            return Err(SinkError::Internal(format!(
                "add_rows on failed channel: {}",
                self.load_id_info()
            )));
        }
        if rows.num_rows() == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.eos_sent {
            return Err(SinkError::Internal(format!(
                "add_rows after eos: {}",
                self.load_id_info()
            )));
        }

        let total_rows = rows.num_rows();
        let total_bytes = record_batch_bytes(&rows);
        let mut offset = 0usize;
        while offset < total_rows {
            let room = self.ctx.batch_max_rows.saturating_sub(inner.batch_rows);
            let take = room.min(total_rows - offset).max(1);
            let slice = rows.slice(offset, take);
            inner.batch_rows += take;
            inner.batch_bytes += total_bytes * take / total_rows;
            inner.batch.push(slice);
            inner
                .tablet_ids
                .extend(std::iter::repeat_n(tablet_id, take));
            offset += take;

            if inner.batch_rows >= self.ctx.batch_max_rows
                || inner.batch_bytes >= self.ctx.batch_max_bytes
            {
                self.send_cur_batch(&mut inner, false)?;
            }
        }
        Ok(())
    }

    /// Force-send the remainder with eos set.
    pub fn mark_close(&self) -> SinkResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.eos_sent {
            return Err(SinkError::Internal(format!(
                "mark_close called twice: {}",
                self.load_id_info()
            )));
        }
        self.send_cur_batch(&mut inner, true)?;
        inner.eos_sent = true;
        Ok(())
    }

    /// Block until the final in-flight packet completes; returns the
    /// per-tablet commit metadata from the eos reply.
    pub fn close_wait(&self) -> SinkResult<Vec<PTabletInfo>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.eos_sent {
            return Err(SinkError::Internal(format!(
                "close_wait without mark_close: {}",
                self.load_id_info()
            )));
        }
        self.wait_in_flight_packet(&mut inner)?;
        Ok(std::mem::take(&mut inner.tablet_infos))
    }

    /// Mark failed and fire a best-effort cancel to the remote writer. The
    /// in-flight packet, if any, is abandoned on the client runtime.
    pub fn cancel(&self) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stub = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.stub.as_ref().map(Arc::clone)
        };
        if let Some(stub) = stub {
            debug!("cancel node channel: {}", self.load_id_info());
            let request = PTabletWriterCancelRequest {
                id: Some(PUniqueId {
                    hi: self.ctx.load_id.hi,
                    lo: self.ctx.load_id.lo,
                }),
                index_id: self.index_id,
                sender_id: self.ctx.sender_id,
            };
            drop(stub.tablet_writer_cancel(request));
        }
    }

    /// Fold this channel's timers into the sink-level aggregates.
    pub fn time_report(
        &self,
        serialize_batch_ns: &mut i64,
        wait_in_flight_packet_ns: &mut i64,
        add_batch_counter_map: &mut HashMap<i64, AddBatchCounter>,
    ) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *serialize_batch_ns += clamp_u128_to_i64(inner.serialize_batch_ns);
        *wait_in_flight_packet_ns += clamp_u128_to_i64(inner.wait_in_flight_packet_ns);
        let entry = add_batch_counter_map.entry(self.node_id).or_default();
        *entry += inner.add_batch_counter;
    }

    fn send_cur_batch(&self, inner: &mut ChannelInner, eos: bool) -> SinkResult<()> {
        self.wait_in_flight_packet(inner)?;

        let serialize_start = Instant::now();
        let payload = crate::exec::chunk::encode_batches(&self.tuple.schema, &inner.batch)
            .map_err(|e| {
                SinkError::SerializeFailed(format!("{e}: {}", self.load_id_info()))
            })?;
        inner.serialize_batch_ns += serialize_start.elapsed().as_nanos();

        let packet_seq = inner.next_packet_seq;
        let request = PTabletWriterAddBatchRequest {
            id: Some(PUniqueId {
                hi: self.ctx.load_id.hi,
                lo: self.ctx.load_id.lo,
            }),
            index_id: self.index_id,
            sender_id: self.ctx.sender_id,
            packet_seq,
            tablet_ids: std::mem::take(&mut inner.tablet_ids),
            row_batch: payload,
            eos,
            partition_ids: if eos {
                self.ctx.staged_partitions()
            } else {
                Vec::new()
            },
        };
        debug!(
            "send batch: {}, seq={} rows={} eos={}",
            self.load_id_info(),
            packet_seq,
            inner.batch_rows,
            eos
        );

        let Some(stub) = inner.stub.as_ref().map(Arc::clone) else {
            return Err(SinkError::Internal(format!(
                "send on uninitialized channel: {}",
                self.load_id_info()
            )));
        };
        inner.in_flight = Some(stub.tablet_writer_add_batch(request));
        inner.next_packet_seq += 1;
        inner.batch.clear();
        inner.batch_rows = 0;
        inner.batch_bytes = 0;
        Ok(())
    }

    fn wait_in_flight_packet(&self, inner: &mut ChannelInner) -> SinkResult<()> {
        let Some(rpc) = inner.in_flight.take() else {
            return Ok(());
        };
        let wait_start = Instant::now();
        let result = rpc.wait(self.ctx.rpc_timeout);
        inner.wait_in_flight_packet_ns += wait_start.elapsed().as_nanos();

        let result = result.map_err(|e| match e {
            RpcError::Timeout(t) => SinkError::RemoteRejected(format!(
                "add batch rpc timed out after {t:?}: {}",
                self.load_id_info()
            )),
            RpcError::Transport(msg) => {
                SinkError::RemoteRejected(format!("{msg}: {}", self.load_id_info()))
            }
        })?;

        inner.add_batch_counter += AddBatchCounter {
            add_batch_execution_time_us: result.execution_time_us,
            add_batch_wait_lock_time_us: result.wait_lock_time_us,
            add_batch_num: 1,
        };
        if status_code(result.status.as_ref()) != 0 {
            warn!(
                "add batch rejected: {}, {}",
                self.load_id_info(),
                status_message(result.status.as_ref())
            );
            return Err(SinkError::RemoteRejected(format!(
                "{}: {}",
                status_message(result.status.as_ref()),
                self.load_id_info()
            )));
        }
        if !result.tablet_vec.is_empty() {
            inner.tablet_infos.extend(result.tablet_vec);
        }
        Ok(())
    }
}
