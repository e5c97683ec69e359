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
//! Bounded single-producer/single-consumer staging between the sink's send
//! thread and the node channels, used in multi-threaded mode.
//!
//! The sink thread is the sole producer of every buffer; each buffer is
//! drained by exactly one consumer thread in FIFO order. Row payloads are
//! deep-copied out of the input chunk before push, so the producer can reuse
//! input storage immediately. Every link blocks rather than drops: producer
//! -> bounded queue -> consumer -> single-in-flight node channel rpc.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::RecordBatch;
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::exec::chunk::record_batch_bytes;
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};
use crate::sink::error::{SinkError, SinkResult};
use crate::sink::index_channel::IndexChannel;
use crate::tabletload_logging::{debug, warn};

/// One staged row group: the rows of one tablet bound for one node of one
/// index.
struct BufferedRows {
    index_idx: usize,
    node_id: i64,
    tablet_id: i64,
    rows: RecordBatch,
    // Held until the consumer hands the rows to the node channel.
    _tracked: TrackedBytes,
}

pub struct RowBuffer {
    tx: Mutex<Option<Sender<BufferedRows>>>,
    rx: Receiver<BufferedRows>,
    consume_err: AtomicBool,
    first_error: Mutex<Option<SinkError>>,
    mem_tracker: Arc<MemTracker>,
}

impl RowBuffer {
    pub fn new(size_limit: usize, byte_limit: i64, parent: &Arc<MemTracker>, label: String) -> Self {
        let (tx, rx) = bounded(size_limit.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            consume_err: AtomicBool::new(false),
            first_error: Mutex::new(None),
            mem_tracker: MemTracker::new_child_with_limit(label, byte_limit, parent),
        }
    }

    pub fn workable(&self) -> bool {
        !self.consume_err.load(Ordering::Acquire)
            && self
                .tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
    }

    /// Producer side. Deep-copies are already done by the caller (`rows` owns
    /// its buffers); this accounts the bytes and block-pushes into the queue.
    pub fn push(
        &self,
        index_idx: usize,
        node_id: i64,
        tablet_id: i64,
        rows: RecordBatch,
    ) -> SinkResult<()> {
        if self.consume_err.load(Ordering::Acquire) {
            return Err(self.buffer_off_error());
        }
        let bytes = record_batch_bytes(&rows);
        let tracked = TrackedBytes::try_new(bytes, Arc::clone(&self.mem_tracker)).ok_or_else(
            || {
                SinkError::MemLimit(format!(
                    "row buffer {} would exceed its byte limit: current={} limit={} push={}",
                    self.mem_tracker.label(),
                    self.mem_tracker.current(),
                    self.mem_tracker.limit(),
                    bytes
                ))
            },
        )?;
        let entry = BufferedRows {
            index_idx,
            node_id,
            tablet_id,
            rows,
            _tracked: tracked,
        };
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return Err(self.buffer_off_error());
        };
        // Blocks while the queue is full; the consumer keeps draining even
        // after an error, so this cannot deadlock.
        sender
            .send(entry)
            .map_err(|_| self.buffer_off_error())
    }

    /// Producer signals end of input; the consumer exits once the backlog is
    /// drained.
    pub fn turn_off(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    /// Cancel path: poison the buffer so the consumer drops the backlog.
    pub fn shutdown(&self, cause: SinkError) {
        self.set_consume_err(cause);
        self.turn_off();
    }

    pub fn take_error(&self) -> Option<SinkError> {
        self.first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Consumer thread body. Drains entries into the destination node
    /// channels; after a load-fatal verdict it keeps draining and dropping so
    /// the producer never blocks forever.
    pub fn consume_process(&self, buffer_id: usize, channels: &[Arc<IndexChannel>]) {
        let mut consumed = 0usize;
        let mut dropped = 0usize;
        loop {
            let entry = match self.rx.recv() {
                Ok(entry) => entry,
                // Producer turned the buffer off and the queue is empty.
                Err(_) => break,
            };
            consumed += 1;
            if self.consume_err.load(Ordering::Acquire) {
                dropped += 1;
                continue;
            }

            let Some(index_channel) = channels.get(entry.index_idx) else {
                self.set_consume_err(SinkError::Internal(format!(
                    "buffer {} entry references unknown index slot {}",
                    buffer_id, entry.index_idx
                )));
                continue;
            };
            let Some(node_channel) = index_channel.node_channel(entry.node_id) else {
                self.set_consume_err(SinkError::Internal(format!(
                    "buffer {} entry references unknown node {} of index {}",
                    buffer_id,
                    entry.node_id,
                    index_channel.index_id()
                )));
                continue;
            };
            if node_channel.is_failed() {
                dropped += 1;
                continue;
            }
            if let Err(e) = node_channel.add_rows(entry.rows, entry.tablet_id) {
                warn!(
                    "buffer {} add rows failed on node {}: {e}",
                    buffer_id, entry.node_id
                );
                if index_channel.handle_failed_node(&node_channel, &e) {
                    self.set_consume_err(SinkError::QuorumLost(format!(
                        "index {} lost the replica write quorum, caused by: {e}",
                        index_channel.index_id()
                    )));
                }
            }
        }
        debug!(
            "row buffer {} consumer exit: consumed={} dropped={} peak_bytes={}",
            buffer_id,
            consumed,
            dropped,
            self.mem_tracker.peak()
        );
    }

    fn set_consume_err(&self, cause: SinkError) {
        let mut guard = self
            .first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(cause);
        }
        self.consume_err.store(true, Ordering::Release);
    }

    fn buffer_off_error(&self) -> SinkError {
        match self.take_error() {
            Some(err) => err,
            None => SinkError::BufferOff("row buffer turned off".to_string()),
        }
    }
}
