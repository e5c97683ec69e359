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
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::common::types::UniqueId;
use crate::service::tablet_writer::TabletWriterStubFactory;
use crate::sink::descriptors::NodesInfo;

/// Wire tuple layout of one materialized index. Rollups store a subset of
/// the table columns, so each index carries its own (possibly narrowed)
/// schema, resolved at prepare against the table-wide batch layout.
pub struct IndexTupleSchema {
    pub index_id: i64,
    pub schema: SchemaRef,
    pub schema_ipc: Vec<u8>,
    /// Position of each of this index's columns in the table-wide batch.
    column_picks: Vec<usize>,
}

impl IndexTupleSchema {
    pub fn new(
        index_id: i64,
        schema: SchemaRef,
        schema_ipc: Vec<u8>,
        column_picks: Vec<usize>,
    ) -> Self {
        Self {
            index_id,
            schema,
            schema_ipc,
            column_picks,
        }
    }

    /// Narrow a table-wide batch to this index's columns. Column picks are
    /// Arc clones; no row data is copied.
    pub fn project(&self, batch: &RecordBatch) -> Result<RecordBatch, String> {
        let columns = self
            .column_picks
            .iter()
            .map(|idx| {
                batch.columns().get(*idx).cloned().ok_or_else(|| {
                    format!(
                        "index {} column pick {} out of range (batch has {} columns)",
                        self.index_id,
                        idx,
                        batch.num_columns()
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        RecordBatch::try_new(Arc::clone(&self.schema), columns)
            .map_err(|e| format!("narrow batch to index {} failed: {e}", self.index_id))
    }
}

/// Immutable load-scoped state shared by every channel of one sink, plus the
/// partition-id set the routing path appends to. The sink outlives all of its
/// channels, so channels hold this through an `Arc` instead of a back pointer.
pub struct SinkContext {
    pub load_id: UniqueId,
    pub txn_id: i64,
    pub db_id: i64,
    pub table_id: i64,
    pub sender_id: i32,
    pub num_senders: i32,
    pub need_gen_rollup: bool,
    pub load_mem_limit: i64,
    pub load_channel_timeout_s: i64,
    pub rpc_timeout: Duration,
    /// Per-channel packet caps; a batch is sealed when either is reached.
    pub batch_max_rows: usize,
    pub batch_max_bytes: usize,
    /// Per-index wire tuple layouts, keyed by index id.
    index_schemas: HashMap<i64, Arc<IndexTupleSchema>>,
    pub nodes_info: NodesInfo,
    pub stub_factory: Arc<dyn TabletWriterStubFactory>,
    partition_ids: RwLock<HashSet<i64>>,
}

impl SinkContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        load_id: UniqueId,
        txn_id: i64,
        db_id: i64,
        table_id: i64,
        sender_id: i32,
        num_senders: i32,
        need_gen_rollup: bool,
        load_mem_limit: i64,
        load_channel_timeout_s: i64,
        rpc_timeout: Duration,
        batch_max_rows: usize,
        batch_max_bytes: usize,
        index_schemas: HashMap<i64, Arc<IndexTupleSchema>>,
        nodes_info: NodesInfo,
        stub_factory: Arc<dyn TabletWriterStubFactory>,
    ) -> Self {
        Self {
            load_id,
            txn_id,
            db_id,
            table_id,
            sender_id,
            num_senders,
            need_gen_rollup,
            load_mem_limit,
            load_channel_timeout_s,
            rpc_timeout,
            batch_max_rows: batch_max_rows.max(1),
            batch_max_bytes: batch_max_bytes.max(1),
            index_schemas,
            nodes_info,
            stub_factory,
            partition_ids: RwLock::new(HashSet::new()),
        }
    }

    pub fn index_schema(&self, index_id: i64) -> Option<Arc<IndexTupleSchema>> {
        self.index_schemas.get(&index_id).map(Arc::clone)
    }

    /// Record a partition as written by this sender. Readers dominate; a
    /// write happens only the first time a partition shows up in a batch.
    pub fn stage_partition(&self, partition_id: i64) {
        {
            let guard = self
                .partition_ids
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if guard.contains(&partition_id) {
                return;
            }
        }
        let mut guard = self
            .partition_ids
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(partition_id);
    }

    /// Stable snapshot of the staged partition ids, carried on the eos packet.
    pub fn staged_partitions(&self) -> Vec<i64> {
        let guard = self
            .partition_ids
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<i64> = guard.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn load_id_info(&self) -> String {
        format!(
            "load_id={}, txn_id={}, table_id={}, sender_id={}",
            self.load_id, self.txn_id, self.table_id, self.sender_id
        )
    }
}
