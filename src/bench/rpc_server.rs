//! Benchmark RPC server: echoes payloads and counts invocations.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::rpc::{RpcHandler, RpcInput, RpcOutput, RpcRequest};
use crate::utils::ClusterBenchError;

use async_trait::async_trait;

/// Echo handler under measurement. The invocation counter belongs to this
/// instance only.
pub struct BenchRpcServer {
    me: String,
    invocations: AtomicU64,
}

impl BenchRpcServer {
    pub fn new(me: impl Into<String>) -> Self {
        BenchRpcServer {
            me: me.into(),
            invocations: AtomicU64::new(0),
        }
    }

    /// Number of payloads echoed since creation or the last reset.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.invocations.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl RpcHandler for BenchRpcServer {
    async fn handle(
        &self,
        req: RpcRequest,
    ) -> Result<RpcOutput, ClusterBenchError> {
        match req.input {
            RpcInput::Payload { items } => {
                self.invocations.fetch_add(1, Ordering::Relaxed);
                Ok(RpcOutput::Payload { items })
            }
            other => {
                logged_err!(self.me; "unexpected benchmark input {:?}", other)
            }
        }
    }
}

#[cfg(test)]
mod rpc_server_tests {
    use super::*;
    use crate::rpc::make_payload;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn echo_and_count() -> Result<(), ClusterBenchError> {
        let server = Arc::new(BenchRpcServer::new("b"));
        let mut handles = vec![];
        for _ in 0..8 {
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let items = make_payload(3);
                    let out = server
                        .handle(RpcRequest::global(RpcInput::Payload {
                            items: items.clone(),
                        }))
                        .await?;
                    assert_eq!(out, RpcOutput::Payload { items });
                }
                Ok::<(), ClusterBenchError>(())
            }));
        }
        for h in handles {
            h.await??;
        }
        assert_eq!(server.invocation_count(), 400);
        server.reset();
        assert_eq!(server.invocation_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn rejects_other_input() {
        let server = BenchRpcServer::new("b");
        assert!(server
            .handle(RpcRequest::global(RpcInput::Discover))
            .await
            .is_err());
        assert_eq!(server.invocation_count(), 0);
    }
}
