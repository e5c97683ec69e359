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
//! The tablet-load sink front-end.
//!
//! Per input chunk: project into the destination schema, validate each row
//! against its column domains, route valid rows to their partition and
//! bucket, and fan each row group out to the replica node channels of every
//! index, either directly or through the row buffers in multi-threaded mode.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::{Field, Schema, SchemaRef};

use crate::common::config;
use crate::exec::chunk::{Chunk, encode_schema};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{RuntimeProfile, TUnit, attach_mem_tracker_tree, clamp_u128_to_i64};
use crate::runtime::runtime_state::RuntimeState;
use crate::service::tablet_writer::TabletWriterStubFactory;
use crate::sink::context::{IndexTupleSchema, SinkContext};
use crate::sink::data_sink::DataSink;
use crate::sink::descriptors::TableSinkParams;
use crate::sink::error::{SinkError, SinkResult};
use crate::sink::index_channel::{IndexChannel, TabletWithPartition};
use crate::sink::node_channel::AddBatchCounter;
use crate::sink::routing::TabletRouter;
use crate::sink::row_buffer::RowBuffer;
use crate::sink::validate::{DecimalBounds, FilterBitmap, decimal_bounds, validate_chunk};
use crate::tabletload_logging::{info, warn};

pub struct TabletSink {
    params: TableSinkParams,
    stub_factory: Arc<dyn TabletWriterStubFactory>,
    profile: RuntimeProfile,

    // Bound at prepare.
    output_schema: Option<SchemaRef>,
    projection: Option<Vec<usize>>,
    bounds: Vec<Option<DecimalBounds>>,
    router: Option<TabletRouter>,
    ctx: Option<Arc<SinkContext>>,

    // Built at open, torn down at close.
    channels: Vec<Arc<IndexChannel>>,
    buffers: Vec<Arc<RowBuffer>>,
    consumer_threads: Vec<JoinHandle<()>>,
    mem_tracker: Option<Arc<MemTracker>>,

    next_random_bucket: u32,
    closed: bool,

    num_input_rows: i64,
    num_output_rows: i64,
    num_filtered_rows: i64,
    send_data_ns: u128,
    convert_chunk_ns: u128,
    validate_data_ns: u128,
    open_ns: u128,
    close_ns: u128,
}

impl TabletSink {
    /// Bind the parsed sink description. Fails with `InvalidConfig` when the
    /// record is internally inconsistent.
    pub fn try_new(
        params: TableSinkParams,
        stub_factory: Arc<dyn TabletWriterStubFactory>,
    ) -> SinkResult<Self> {
        params.validate()?;
        let profile = RuntimeProfile::new(format!("TabletSink (load_id={})", params.load_id));
        Ok(Self {
            params,
            stub_factory,
            profile,
            output_schema: None,
            projection: None,
            bounds: Vec::new(),
            router: None,
            ctx: None,
            channels: Vec::new(),
            buffers: Vec::new(),
            consumer_threads: Vec::new(),
            mem_tracker: None,
            next_random_bucket: 0,
            closed: false,
            num_input_rows: 0,
            num_output_rows: 0,
            num_filtered_rows: 0,
            send_data_ns: 0,
            convert_chunk_ns: 0,
            validate_data_ns: 0,
            open_ns: 0,
            close_ns: 0,
        })
    }

    pub fn try_from_json(
        blob: &str,
        stub_factory: Arc<dyn TabletWriterStubFactory>,
    ) -> SinkResult<Self> {
        let params = TableSinkParams::from_json(blob)?;
        Self::try_new(params, stub_factory)
    }

    fn use_multi_thread(&self) -> bool {
        self.params.buffer_num > 0
    }

    fn ctx(&self) -> SinkResult<&Arc<SinkContext>> {
        self.ctx
            .as_ref()
            .ok_or_else(|| SinkError::Internal("sink used before prepare".to_string()))
    }

    fn router(&self) -> SinkResult<&TabletRouter> {
        self.router
            .as_ref()
            .ok_or_else(|| SinkError::Internal("sink used before prepare".to_string()))
    }

    /// Project the input chunk into the destination column order. The real
    /// expression engine runs upstream; the sink only materializes column
    /// picks with an implicit cast.
    fn convert_chunk(&self, chunk: &Chunk) -> SinkResult<Chunk> {
        let schema = self
            .output_schema
            .as_ref()
            .ok_or_else(|| SinkError::Internal("convert before prepare".to_string()))?;

        let columns: Vec<ArrayRef> = match self.projection.as_ref() {
            Some(projection) => projection
                .iter()
                .zip(schema.fields())
                .map(|(src, field)| {
                    let column = chunk.columns().get(*src).ok_or_else(|| {
                        SinkError::InvalidConfig(format!(
                            "output expr references input column {src}, chunk has {}",
                            chunk.columns().len()
                        ))
                    })?;
                    cast_to(column, field)
                })
                .collect::<SinkResult<_>>()?,
            None => {
                if chunk.columns().len() != schema.fields().len() {
                    return Err(SinkError::Internal(format!(
                        "direct load column count mismatch: chunk={} schema={}",
                        chunk.columns().len(),
                        schema.fields().len()
                    )));
                }
                chunk
                    .columns()
                    .iter()
                    .zip(schema.fields())
                    .map(|(column, field)| cast_to(column, field))
                    .collect::<SinkResult<_>>()?
            }
        };

        let batch = RecordBatch::try_new(Arc::clone(schema), columns)
            .map_err(|e| SinkError::Internal(format!("build output batch failed: {e}")))?;
        Ok(Chunk::new(batch))
    }

    fn check_buffers_workable(&self) -> SinkResult<()> {
        for buffer in &self.buffers {
            if !buffer.workable() {
                return Err(buffer.take_error().unwrap_or_else(|| {
                    SinkError::BufferOff("row buffer turned off".to_string())
                }));
            }
        }
        Ok(())
    }

    fn join_consumer_threads(&mut self) {
        for handle in self.consumer_threads.drain(..) {
            if handle.join().is_err() {
                warn!("row buffer consumer thread panicked");
            }
        }
    }

    fn publish_profile(&mut self) {
        self.profile
            .counter_set("InputRows", TUnit::Unit, self.num_input_rows);
        self.profile
            .counter_set("OutputRows", TUnit::Unit, self.num_output_rows);
        self.profile
            .counter_set("FilteredRows", TUnit::Unit, self.num_filtered_rows);
        self.profile.counter_set(
            "SendDataTime",
            TUnit::TimeNs,
            clamp_u128_to_i64(self.send_data_ns),
        );
        self.profile.counter_set(
            "ConvertChunkTime",
            TUnit::TimeNs,
            clamp_u128_to_i64(self.convert_chunk_ns),
        );
        self.profile.counter_set(
            "ValidateDataTime",
            TUnit::TimeNs,
            clamp_u128_to_i64(self.validate_data_ns),
        );
        self.profile
            .counter_set("OpenTime", TUnit::TimeNs, clamp_u128_to_i64(self.open_ns));
        self.profile
            .counter_set("CloseTime", TUnit::TimeNs, clamp_u128_to_i64(self.close_ns));

        let mut serialize_batch_ns = 0_i64;
        let mut wait_in_flight_packet_ns = 0_i64;
        let mut add_batch_counters: HashMap<i64, AddBatchCounter> = HashMap::new();
        for channel in &self.channels {
            channel.time_report(
                &mut serialize_batch_ns,
                &mut wait_in_flight_packet_ns,
                &mut add_batch_counters,
            );
        }
        self.profile
            .counter_set("SerializeBatchTime", TUnit::TimeNs, serialize_batch_ns);
        self.profile.counter_set(
            "WaitInFlightPacketTime",
            TUnit::TimeNs,
            wait_in_flight_packet_ns,
        );
        for (node_id, counter) in add_batch_counters {
            let child = self.profile.child(format!("NodeChannel (id={node_id})"));
            child.counter_set(
                "AddBatchExecutionTime",
                TUnit::TimeNs,
                counter.add_batch_execution_time_us.saturating_mul(1000),
            );
            child.counter_set(
                "AddBatchWaitLockTime",
                TUnit::TimeNs,
                counter.add_batch_wait_lock_time_us.saturating_mul(1000),
            );
            child.counter_set("AddBatchNum", TUnit::Unit, counter.add_batch_num);
        }

        if let Some(tracker) = self.mem_tracker.as_ref() {
            attach_mem_tracker_tree(&self.profile, tracker);
        }
    }
}

fn cast_to(column: &ArrayRef, field: &Field) -> SinkResult<ArrayRef> {
    if column.data_type() == field.data_type() {
        return Ok(Arc::clone(column));
    }
    arrow::compute::cast(column, field.data_type()).map_err(|e| {
        SinkError::Internal(format!(
            "cast column to {:?} failed: {e}",
            field.data_type()
        ))
    })
}

impl DataSink for TabletSink {
    fn prepare(&mut self, state: &RuntimeState) -> SinkResult<()> {
        // Memory-level schema: every field nullable so invalid rows survive
        // until validation filters them. Declared nullability is enforced by
        // the validator, not by the batch layout.
        let fields: Vec<Field> = self
            .params
            .schema
            .columns
            .iter()
            .map(|col| Field::new(&col.name, col.column_type.to_arrow(), true))
            .collect();
        let output_schema: SchemaRef = Arc::new(Schema::new(fields));

        // Each index gets its own wire tuple layout: rollups store a subset
        // of the table columns, resolved here against the table-wide batch.
        let mut index_schemas = HashMap::new();
        for index in &self.params.schema.indexes {
            let mut column_picks = Vec::with_capacity(index.columns.len());
            let mut index_fields = Vec::with_capacity(index.columns.len());
            for col in &index.columns {
                let pick = self.params.schema.column_index(&col.name).ok_or_else(|| {
                    SinkError::InvalidConfig(format!(
                        "index {} column {} not found in table schema",
                        index.index_id, col.name
                    ))
                })?;
                column_picks.push(pick);
                index_fields.push(Field::new(&col.name, col.column_type.to_arrow(), true));
            }
            let index_schema: SchemaRef = Arc::new(Schema::new(index_fields));
            let schema_ipc = encode_schema(&index_schema).map_err(|e| {
                SinkError::SerializeFailed(format!(
                    "encode index {} tuple schema: {e}",
                    index.index_id
                ))
            })?;
            index_schemas.insert(
                index.index_id,
                Arc::new(IndexTupleSchema::new(
                    index.index_id,
                    index_schema,
                    schema_ipc,
                    column_picks,
                )),
            );
        }

        self.projection = self
            .params
            .output_exprs
            .as_ref()
            .map(|exprs| exprs.iter().map(|e| e.input_column).collect());
        self.bounds = decimal_bounds(&self.params.schema.columns);
        self.router = Some(TabletRouter::new(
            &self.params.schema,
            &self.params.partition,
        )?);

        let rpc_timeout_ms = if self.params.rpc_timeout_ms > 0 {
            self.params.rpc_timeout_ms
        } else {
            config::rpc_timeout_ms()
        };
        let load_channel_timeout_s = if self.params.load_channel_timeout_s > 0 {
            self.params.load_channel_timeout_s
        } else {
            config::load_channel_timeout_s()
        };
        self.ctx = Some(Arc::new(SinkContext::new(
            self.params.load_id,
            self.params.txn_id,
            self.params.db_id,
            self.params.table_id,
            state.sender_id(),
            state.num_senders(),
            self.params.need_gen_rollup,
            self.params.load_mem_limit,
            load_channel_timeout_s,
            Duration::from_millis(rpc_timeout_ms as u64),
            state.batch_size(),
            config::sink_max_batch_bytes(),
            index_schemas,
            self.params.nodes_info.clone(),
            Arc::clone(&self.stub_factory),
        )));
        self.output_schema = Some(output_schema);

        self.profile
            .add_info_string("Table", format!("{}.{}", self.params.db_name, self.params.table_name));
        self.profile
            .add_info_string("TxnId", self.params.txn_id.to_string());
        for name in ["InputRows", "OutputRows", "FilteredRows"] {
            self.profile.add_counter(name, TUnit::Unit);
        }
        for name in [
            "SendDataTime",
            "ConvertChunkTime",
            "ValidateDataTime",
            "OpenTime",
            "CloseTime",
            "SerializeBatchTime",
            "WaitInFlightPacketTime",
        ] {
            self.profile.add_timer(name);
        }
        Ok(())
    }

    fn open(&mut self, state: &RuntimeState) -> SinkResult<()> {
        let open_start = Instant::now();
        let ctx = Arc::clone(self.ctx()?);
        self.mem_tracker = Some(MemTracker::new_child(
            format!("TabletSink (load_id={})", self.params.load_id),
            &state.mem_tracker(),
        ));

        for index in &self.params.schema.indexes {
            let mut tablets = Vec::new();
            for partition in &self.params.partition.partitions {
                for index_tablets in &partition.indexes {
                    if index_tablets.index_id != index.index_id {
                        continue;
                    }
                    for tablet_id in &index_tablets.tablet_ids {
                        tablets.push(TabletWithPartition {
                            partition_id: partition.partition_id,
                            tablet_id: *tablet_id,
                        });
                    }
                }
            }
            let channel = IndexChannel::init(
                &ctx,
                index.index_id,
                index.schema_hash,
                &tablets,
                &self.params.location,
                self.params.num_replicas as usize,
            )?;
            self.channels.push(Arc::new(channel));
        }

        // Dispatch every open before joining any, so total open latency is
        // bounded by the slowest node, not the sum.
        for channel in &self.channels {
            channel.open();
        }
        let mut first_error = None;
        for channel in &self.channels {
            if let Err(e) = channel.open_wait() {
                first_error = Some(e);
                break;
            }
        }
        if let Some(e) = first_error {
            for channel in &self.channels {
                channel.cancel();
            }
            self.open_ns += open_start.elapsed().as_nanos();
            return Err(e);
        }

        if self.use_multi_thread() {
            let mem_tracker = self
                .mem_tracker
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| SinkError::Internal("open without mem tracker".to_string()))?;
            let byte_limit = if self.params.mem_limit_per_buf > 0 {
                self.params.mem_limit_per_buf
            } else {
                config::buffer_mem_limit_bytes()
            };
            let size_limit = if self.params.size_limit_per_buf > 0 {
                self.params.size_limit_per_buf as usize
            } else {
                config::buffer_size_limit()
            };
            for i in 0..self.params.buffer_num as usize {
                self.buffers.push(Arc::new(RowBuffer::new(
                    size_limit,
                    byte_limit,
                    &mem_tracker,
                    format!("RowBuffer-{i}"),
                )));
            }
            for (i, buffer) in self.buffers.iter().enumerate() {
                let buffer = Arc::clone(buffer);
                let channels = self.channels.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("tablet-sink-buf-{i}"))
                    .spawn(move || buffer.consume_process(i, &channels))
                    .map_err(|e| {
                        SinkError::Internal(format!("spawn buffer consumer failed: {e}"))
                    })?;
                self.consumer_threads.push(handle);
            }
        }

        info!(
            "tablet sink opened: {}, indexes={} buffers={}",
            ctx.load_id_info(),
            self.channels.len(),
            self.buffers.len()
        );
        self.open_ns += open_start.elapsed().as_nanos();
        Ok(())
    }

    fn send(&mut self, state: &RuntimeState, chunk: &Chunk) -> SinkResult<()> {
        if state.is_cancelled() {
            return Err(SinkError::Cancelled("runtime state cancelled".to_string()));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let send_start = Instant::now();
        self.num_input_rows += chunk.len() as i64;

        if self.use_multi_thread() {
            self.check_buffers_workable()?;
        }

        let convert_start = Instant::now();
        let output = self.convert_chunk(chunk)?;
        self.convert_chunk_ns += convert_start.elapsed().as_nanos();

        let validate_start = Instant::now();
        let mut filter = FilterBitmap::new(output.len());
        validate_chunk(
            &self.params.schema.columns,
            &self.bounds,
            &output,
            &mut filter,
        )?;
        self.validate_data_ns += validate_start.elapsed().as_nanos();

        let mut next_random_bucket = self.next_random_bucket;
        let targets =
            self.router()?
                .route_chunk(&output, &mut filter, &mut next_random_bucket)?;
        self.next_random_bucket = next_random_bucket;

        let mut groups: BTreeMap<(usize, usize), Vec<u32>> = BTreeMap::new();
        for (row, target) in targets.iter().enumerate() {
            if let Some(target) = target {
                groups
                    .entry((target.partition_idx, target.bucket))
                    .or_default()
                    .push(row as u32);
            }
        }

        let result: SinkResult<()> = (|| {
            for ((partition_idx, bucket), rows) in &groups {
                let router = self.router()?;
                self.ctx()?.stage_partition(router.partition_id(*partition_idx));
                // One deep copy per row group; replicas and indexes share it.
                let taken = output
                    .take_rows(rows)
                    .map_err(SinkError::Internal)?;
                for (index_idx, index_channel) in self.channels.iter().enumerate() {
                    let tablet_id =
                        router.tablet(*partition_idx, index_channel.index_id(), *bucket)?;
                    let narrowed = index_channel
                        .tuple()
                        .project(&taken)
                        .map_err(SinkError::Internal)?;
                    if self.use_multi_thread() {
                        for node_id in index_channel.replica_nodes(tablet_id)? {
                            let slot = node_id.rem_euclid(self.buffers.len() as i64) as usize;
                            self.buffers[slot].push(
                                index_idx,
                                node_id,
                                tablet_id,
                                narrowed.clone(),
                            )?;
                        }
                    } else {
                        index_channel.add_rows(&narrowed, tablet_id)?;
                    }
                }
            }
            Ok(())
        })();

        self.num_filtered_rows += filter.num_filtered() as i64;
        self.num_output_rows += (output.len() - filter.num_filtered()) as i64;
        self.send_data_ns += send_start.elapsed().as_nanos();
        result
    }

    fn close(&mut self, state: &RuntimeState, close_status: SinkResult<()>) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Internal("sink closed twice".to_string()));
        }
        self.closed = true;
        let close_start = Instant::now();

        let mut status = close_status;
        if status.is_ok() && state.is_cancelled() {
            status = Err(SinkError::Cancelled("runtime state cancelled".to_string()));
        }

        if status.is_ok() {
            // Normal path: let the buffers drain, then close every channel,
            // fan-out before join.
            for buffer in &self.buffers {
                buffer.turn_off();
            }
            self.join_consumer_threads();
            for buffer in &self.buffers {
                if status.is_ok() {
                    if let Some(e) = buffer.take_error() {
                        status = Err(e);
                    }
                }
            }
            if status.is_ok() {
                for channel in &self.channels {
                    if let Err(e) = channel.mark_close() {
                        status = Err(e);
                        break;
                    }
                }
            }
            if status.is_ok() {
                for channel in &self.channels {
                    if let Err(e) = channel.close_wait(state) {
                        status = Err(e);
                        break;
                    }
                }
            }
        }

        if let Err(e) = status.as_ref() {
            for buffer in &self.buffers {
                buffer.shutdown(SinkError::Cancelled(format!("load aborted: {e}")));
            }
            self.join_consumer_threads();
            for channel in &self.channels {
                channel.cancel();
            }
        }

        self.close_ns += close_start.elapsed().as_nanos();
        self.publish_profile();
        match status.as_ref() {
            Ok(()) => info!(
                "tablet sink closed: load_id={}, input_rows={} output_rows={} filtered_rows={}",
                self.params.load_id,
                self.num_input_rows,
                self.num_output_rows,
                self.num_filtered_rows
            ),
            Err(e) => warn!("tablet sink closed with error: load_id={}, {e}", self.params.load_id),
        }
        status
    }

    fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }
}
