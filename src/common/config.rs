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
use crate::tabletload_config::config as tabletload_app_config;

pub(crate) fn sink_max_batch_bytes() -> usize {
    tabletload_app_config()
        .ok()
        .map(|c| c.sink.max_batch_bytes)
        .unwrap_or(64 * 1024 * 1024)
}

pub(crate) fn load_channel_timeout_s() -> i64 {
    tabletload_app_config()
        .ok()
        .map(|c| c.sink.load_channel_timeout_s)
        .unwrap_or(600)
}

pub(crate) fn buffer_mem_limit_bytes() -> i64 {
    tabletload_app_config()
        .ok()
        .map(|c| c.sink.buffer_mem_limit_bytes)
        .unwrap_or(64 * 1024 * 1024)
}

pub(crate) fn buffer_size_limit() -> usize {
    tabletload_app_config()
        .ok()
        .map(|c| c.sink.buffer_size_limit)
        .unwrap_or(1024)
}

pub(crate) fn rpc_timeout_ms() -> i32 {
    tabletload_app_config()
        .ok()
        .map(|c| c.client.rpc_timeout_ms)
        .unwrap_or(60_000)
}

pub(crate) fn client_connect_timeout_ms() -> u64 {
    tabletload_app_config()
        .ok()
        .map(|c| c.client.connect_timeout_ms)
        .unwrap_or(10_000)
}

pub(crate) fn client_io_threads() -> usize {
    tabletload_app_config()
        .ok()
        .map(|c| c.client.io_threads)
        .unwrap_or(4)
}

pub(crate) fn client_max_message_bytes() -> usize {
    tabletload_app_config()
        .ok()
        .map(|c| c.client.max_message_bytes)
        .unwrap_or(64 * 1024 * 1024)
}
