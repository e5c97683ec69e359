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
use thiserror::Error;

/// Failure kinds of the tablet-load sink.
///
/// A single NodeChannel error is not fatal by itself; the owning IndexChannel
/// recounts the per-tablet replica quorum and only `QuorumLost` aborts the
/// load.
#[derive(Clone, Debug, Error)]
pub enum SinkError {
    #[error("invalid sink description: {0}")]
    InvalidConfig(String),
    #[error("node {0} not found in nodes info")]
    UnknownNode(i64),
    #[error("tablet writer open rpc failed: {0}")]
    OpenRpcFailed(String),
    #[error("tablet writer rejected the request: {0}")]
    RemoteRejected(String),
    #[error("memory limit exceeded: {0}")]
    MemLimit(String),
    #[error("row buffer is not workable: {0}")]
    BufferOff(String),
    #[error("serialize row batch failed: {0}")]
    SerializeFailed(String),
    #[error("tablet replica quorum lost: {0}")]
    QuorumLost(String),
    #[error("load cancelled: {0}")]
    Cancelled(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type SinkResult<T> = Result<T, SinkError>;
