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
//! All node channels of one materialized index, plus the replica-quorum
//! verdict on node failures.
//!
//! A node channel failure is survivable as long as every tablet it hosted
//! keeps a strict majority of live replicas; the first tablet that drops
//! below that dooms the load.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arrow::array::RecordBatch;

use crate::runtime::runtime_state::RuntimeState;
use crate::sink::context::{IndexTupleSchema, SinkContext};
use crate::sink::descriptors::TableLocationParam;
use crate::sink::error::{SinkError, SinkResult};
use crate::sink::node_channel::{AddBatchCounter, NodeChannel};
use crate::tabletload_logging::{debug, warn};

/// One tablet of this index together with its owning partition, as carried on
/// the tablet-writer open request.
#[derive(Clone, Copy, Debug)]
pub struct TabletWithPartition {
    pub partition_id: i64,
    pub tablet_id: i64,
}

struct IndexState {
    num_failed_channels: usize,
}

pub struct IndexChannel {
    index_id: i64,
    num_replicas: usize,
    tuple: Arc<IndexTupleSchema>,
    node_channels: HashMap<i64, Arc<NodeChannel>>,
    channels_by_tablet: HashMap<i64, Vec<Arc<NodeChannel>>>,
    state: Mutex<IndexState>,
}

fn write_quorum(num_replicas: usize) -> usize {
    num_replicas / 2 + 1
}

impl IndexChannel {
    /// Group `tablets` by hosting node, creating one node channel per node
    /// and the tablet -> replica-channel fan-out table. Frozen afterwards.
    pub fn init(
        ctx: &Arc<SinkContext>,
        index_id: i64,
        schema_hash: i32,
        tablets: &[TabletWithPartition],
        location: &TableLocationParam,
        num_replicas: usize,
    ) -> SinkResult<Self> {
        let tuple = ctx.index_schema(index_id).ok_or_else(|| {
            SinkError::Internal(format!("index {index_id} has no tuple schema"))
        })?;
        let mut builders: HashMap<i64, NodeChannel> = HashMap::new();
        let mut replicas_by_tablet: HashMap<i64, Vec<i64>> = HashMap::new();

        for tablet in tablets {
            let loc = location.find_tablet(tablet.tablet_id).ok_or_else(|| {
                SinkError::InvalidConfig(format!(
                    "tablet {} has no location entry",
                    tablet.tablet_id
                ))
            })?;
            if loc.node_ids.len() != num_replicas {
                return Err(SinkError::InvalidConfig(format!(
                    "tablet {} has {} replicas, expected {}",
                    tablet.tablet_id,
                    loc.node_ids.len(),
                    num_replicas
                )));
            }
            for node_id in &loc.node_ids {
                builders
                    .entry(*node_id)
                    .or_insert_with(|| {
                        NodeChannel::new(
                            Arc::clone(ctx),
                            index_id,
                            schema_hash,
                            Arc::clone(&tuple),
                            *node_id,
                        )
                    })
                    .add_tablet(tablet.partition_id, tablet.tablet_id);
            }
            replicas_by_tablet.insert(tablet.tablet_id, loc.node_ids.clone());
        }

        let mut node_channels = HashMap::with_capacity(builders.len());
        for (node_id, mut channel) in builders {
            channel.init()?;
            node_channels.insert(node_id, Arc::new(channel));
        }

        let mut channels_by_tablet = HashMap::with_capacity(replicas_by_tablet.len());
        for (tablet_id, node_ids) in replicas_by_tablet {
            let channels = node_ids
                .iter()
                .map(|node_id| {
                    node_channels.get(node_id).map(Arc::clone).ok_or_else(|| {
                        SinkError::Internal(format!(
                            "replica node {node_id} of tablet {tablet_id} has no channel"
                        ))
                    })
                })
                .collect::<SinkResult<Vec<_>>>()?;
            channels_by_tablet.insert(tablet_id, channels);
        }

        Ok(Self {
            index_id,
            num_replicas,
            tuple,
            node_channels,
            channels_by_tablet,
            state: Mutex::new(IndexState {
                num_failed_channels: 0,
            }),
        })
    }

    pub fn index_id(&self) -> i64 {
        self.index_id
    }

    /// Wire tuple layout of this index; rows must be narrowed to it before
    /// `add_rows`.
    pub fn tuple(&self) -> &Arc<IndexTupleSchema> {
        &self.tuple
    }

    pub fn node_channel(&self, node_id: i64) -> Option<Arc<NodeChannel>> {
        self.node_channels.get(&node_id).map(Arc::clone)
    }

    pub fn num_node_channels(&self) -> usize {
        self.node_channels.len()
    }

    /// Replica node ids of one tablet, in placement order.
    pub fn replica_nodes(&self, tablet_id: i64) -> SinkResult<Vec<i64>> {
        self.channels_by_tablet
            .get(&tablet_id)
            .map(|channels| channels.iter().map(|ch| ch.node_id()).collect())
            .ok_or_else(|| {
                SinkError::Internal(format!(
                    "tablet {tablet_id} is not routed by index {}",
                    self.index_id
                ))
            })
    }

    /// Dispatch the open RPC of every node channel without waiting, so the
    /// sink can start the opens of every index before joining any of them.
    pub fn open(&self) {
        for channel in self.node_channels.values() {
            channel.open();
        }
    }

    /// Join the open RPCs. A failed open is absorbed by the quorum when
    /// possible.
    pub fn open_wait(&self) -> SinkResult<()> {
        for channel in self.node_channels.values() {
            if let Err(e) = channel.open_wait() {
                warn!("node channel open failed: {e}");
                if self.handle_failed_node(channel, &e) {
                    return Err(quorum_lost(self.index_id, &e));
                }
            }
        }
        Ok(())
    }

    /// Fan `rows` out to every live replica channel of `tablet_id`.
    pub fn add_rows(&self, rows: &RecordBatch, tablet_id: i64) -> SinkResult<()> {
        let channels = self.channels_by_tablet.get(&tablet_id).ok_or_else(|| {
            SinkError::Internal(format!(
                "tablet {tablet_id} is not routed by index {}",
                self.index_id
            ))
        })?;
        for channel in channels {
            if channel.is_failed() {
                continue;
            }
            if let Err(e) = channel.add_rows(rows.clone(), tablet_id) {
                warn!("node channel add rows failed: {e}");
                if self.handle_failed_node(channel, &e) {
                    return Err(quorum_lost(self.index_id, &e));
                }
            }
        }
        Ok(())
    }

    /// Send the remainder of every live channel with eos set.
    pub fn mark_close(&self) -> SinkResult<()> {
        for channel in self.node_channels.values() {
            if channel.is_failed() {
                continue;
            }
            if let Err(e) = channel.mark_close() {
                warn!("node channel close failed: {e}");
                if self.handle_failed_node(channel, &e) {
                    return Err(quorum_lost(self.index_id, &e));
                }
            }
        }
        Ok(())
    }

    /// Join the final packets and publish the per-tablet commit metadata.
    pub fn close_wait(&self, state: &RuntimeState) -> SinkResult<()> {
        for channel in self.node_channels.values() {
            if channel.is_failed() {
                continue;
            }
            match channel.close_wait() {
                Ok(infos) => state.add_tablet_commit_infos(infos),
                Err(e) => {
                    warn!("node channel close wait failed: {e}");
                    if self.handle_failed_node(channel, &e) {
                        return Err(quorum_lost(self.index_id, &e));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn cancel(&self) {
        for channel in self.node_channels.values() {
            channel.cancel();
        }
    }

    /// Mark `channel` failed and recount the live replicas of every tablet it
    /// hosts. Returns true when the load can no longer succeed.
    pub fn handle_failed_node(&self, channel: &Arc<NodeChannel>, cause: &SinkError) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if channel.is_failed() {
            return false;
        }
        channel.set_failed();
        state.num_failed_channels += 1;
        warn!(
            "mark node channel failed: index_id={} node_id={} failed_channels={} cause={}",
            self.index_id,
            channel.node_id(),
            state.num_failed_channels,
            cause
        );

        let quorum = write_quorum(self.num_replicas);
        for (tablet_id, channels) in &self.channels_by_tablet {
            if channels
                .iter()
                .all(|replica| replica.node_id() != channel.node_id())
            {
                continue;
            }
            let live = channels.iter().filter(|ch| !ch.is_failed()).count();
            if live < quorum {
                warn!(
                    "tablet {} dropped below write quorum: live={} quorum={} replicas={}",
                    tablet_id, live, quorum, self.num_replicas
                );
                return true;
            }
            debug!(
                "tablet {} keeps write quorum: live={} quorum={}",
                tablet_id, live, quorum
            );
        }
        false
    }

    pub fn time_report(
        &self,
        serialize_batch_ns: &mut i64,
        wait_in_flight_packet_ns: &mut i64,
        add_batch_counter_map: &mut HashMap<i64, AddBatchCounter>,
    ) {
        for channel in self.node_channels.values() {
            channel.time_report(
                serialize_batch_ns,
                wait_in_flight_packet_ns,
                add_batch_counter_map,
            );
        }
    }
}

fn quorum_lost(index_id: i64, cause: &SinkError) -> SinkError {
    SinkError::QuorumLost(format!(
        "index {index_id} lost the replica write quorum, caused by: {cause}"
    ))
}
