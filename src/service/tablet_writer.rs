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
//! gRPC client plumbing for the remote tablet-writer service.
//!
//! The sink talks to the service through the [`TabletWriterStub`] trait: every
//! call dispatches asynchronously and hands back a [`PendingRpc`] the caller
//! blocks on when it needs the result. The production stub rides a cached
//! tonic channel per endpoint on a dedicated client runtime; tests substitute
//! in-process stubs.
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tonic::transport::Channel;

use crate::common::config;
use crate::tabletload_logging::debug;

pub mod proto {
    tonic::include_proto!("tabletload");
}

use proto::tablet_writer_service_client::TabletWriterServiceClient;
use proto::{
    PStatus, PTabletWriterAddBatchRequest, PTabletWriterAddBatchResult,
    PTabletWriterCancelRequest, PTabletWriterCancelResult, PTabletWriterOpenRequest,
    PTabletWriterOpenResult,
};

#[derive(Clone, Debug, Error)]
pub enum RpcError {
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Handle to one dispatched RPC. Dropping it abandons the call; the response
/// is discarded on the client runtime.
pub struct PendingRpc<T> {
    rx: mpsc::Receiver<Result<T, RpcError>>,
}

impl<T: Send + 'static> PendingRpc<T> {
    pub fn channel() -> (mpsc::Sender<Result<T, RpcError>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    /// Immediately resolved handle, used by in-process stubs.
    pub fn ready(result: Result<T, RpcError>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Block until the RPC completes or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> Result<T, RpcError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(RpcError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(RpcError::Transport("rpc dispatcher dropped".to_string()))
            }
        }
    }
}

/// Async client surface of the tablet-writer service, one stub per endpoint.
pub trait TabletWriterStub: Send + Sync {
    fn tablet_writer_open(
        &self,
        request: PTabletWriterOpenRequest,
    ) -> PendingRpc<PTabletWriterOpenResult>;

    fn tablet_writer_add_batch(
        &self,
        request: PTabletWriterAddBatchRequest,
    ) -> PendingRpc<PTabletWriterAddBatchResult>;

    fn tablet_writer_cancel(
        &self,
        request: PTabletWriterCancelRequest,
    ) -> PendingRpc<PTabletWriterCancelResult>;
}

/// Creates stubs from node endpoints; the seam tests use to swap in mocks.
pub trait TabletWriterStubFactory: Send + Sync {
    fn create(&self, host: &str, port: u16) -> Result<Arc<dyn TabletWriterStub>, String>;
}

pub fn status_code(status: Option<&PStatus>) -> i32 {
    status.map(|s| s.status_code).unwrap_or(0)
}

pub fn status_message(status: Option<&PStatus>) -> String {
    status
        .map(|s| s.error_msgs.join("; "))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown remote error".to_string())
}

#[derive(Default)]
struct ChannelCache {
    mu: Mutex<HashMap<String, Channel>>,
}

static CHANNELS: OnceLock<ChannelCache> = OnceLock::new();

fn channels() -> &'static ChannelCache {
    CHANNELS.get_or_init(ChannelCache::default)
}

fn client_runtime() -> &'static tokio::runtime::Runtime {
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RT.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(config::client_io_threads().max(1))
            .thread_name("tablet-writer-client")
            .build()
            .expect("build tokio runtime")
    })
}

async fn get_channel(host: &str, port: u16) -> Result<Channel, String> {
    let key = format!("{host}:{port}");
    if let Some(ch) = channels()
        .mu
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&key)
        .cloned()
    {
        return Ok(ch);
    }

    debug!("get_channel: creating new channel for {}", key);
    let endpoint = format!("http://{host}:{port}")
        .parse::<tonic::transport::Endpoint>()
        .map_err(|e| format!("invalid endpoint: {e}"))?
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_millis(config::client_connect_timeout_ms()));

    let ch = endpoint
        .connect()
        .await
        .map_err(|e| format!("connect tablet writer endpoint failed: {e}"))?;

    channels()
        .mu
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key, ch.clone());
    Ok(ch)
}

fn drop_cached_channel(host: &str, port: u16) {
    let key = format!("{host}:{port}");
    channels()
        .mu
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&key);
}

async fn connect_client(host: &str, port: u16) -> Result<TabletWriterServiceClient<Channel>, String> {
    let ch = get_channel(host, port).await?;
    let max_message = config::client_max_message_bytes();
    Ok(TabletWriterServiceClient::new(ch)
        .max_encoding_message_size(max_message)
        .max_decoding_message_size(max_message))
}

/// Production stub: every call is spawned onto the shared client runtime and
/// resolved through the returned [`PendingRpc`].
pub struct GrpcTabletWriterStub {
    host: String,
    port: u16,
}

impl GrpcTabletWriterStub {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn dispatch<T, F, Fut>(&self, call: F) -> PendingRpc<T>
    where
        T: Send + 'static,
        F: FnOnce(TabletWriterServiceClient<Channel>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<tonic::Response<T>, tonic::Status>>
            + Send
            + 'static,
    {
        let (tx, pending) = PendingRpc::channel();
        let host = self.host.clone();
        let port = self.port;
        client_runtime().spawn(async move {
            let result = match connect_client(&host, port).await {
                Ok(client) => match call(client).await {
                    Ok(response) => Ok(response.into_inner()),
                    Err(status) => {
                        drop_cached_channel(&host, port);
                        Err(RpcError::Transport(format!(
                            "tablet writer rpc failed: {status}"
                        )))
                    }
                },
                Err(e) => Err(RpcError::Transport(e)),
            };
            let _ = tx.send(result);
        });
        pending
    }
}

impl TabletWriterStub for GrpcTabletWriterStub {
    fn tablet_writer_open(
        &self,
        request: PTabletWriterOpenRequest,
    ) -> PendingRpc<PTabletWriterOpenResult> {
        self.dispatch(move |mut client| async move { client.tablet_writer_open(request).await })
    }

    fn tablet_writer_add_batch(
        &self,
        request: PTabletWriterAddBatchRequest,
    ) -> PendingRpc<PTabletWriterAddBatchResult> {
        self.dispatch(
            move |mut client| async move { client.tablet_writer_add_batch(request).await },
        )
    }

    fn tablet_writer_cancel(
        &self,
        request: PTabletWriterCancelRequest,
    ) -> PendingRpc<PTabletWriterCancelResult> {
        self.dispatch(move |mut client| async move { client.tablet_writer_cancel(request).await })
    }
}

/// Default factory handing out one gRPC stub per backend endpoint.
#[derive(Default)]
pub struct GrpcStubFactory;

impl TabletWriterStubFactory for GrpcStubFactory {
    fn create(&self, host: &str, port: u16) -> Result<Arc<dyn TabletWriterStub>, String> {
        if host.is_empty() {
            return Err("empty tablet writer host".to_string());
        }
        Ok(Arc::new(GrpcTabletWriterStub::new(host, port)))
    }
}
