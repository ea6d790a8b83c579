//! Single-resolver worker pool draining bounded work queues.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, TunnelError};
use crate::resolver::{QueryType, Resolver};

pub const QUEUE_BUF_SIZE: usize = 512;

/// A single lookup job: query type, fully-qualified domain, and a one-shot
/// sink for the result. At most one value is ever written to the sink.
pub struct Work {
    pub query_type: QueryType,
    pub domain: String,
    pub sink: oneshot::Sender<Result<Vec<u8>>>,
}

enum Job {
    Work(Work),
    Shutdown(oneshot::Sender<()>),
}

/// A handle to a running worker task. Dropping it does not stop the
/// worker; call [`WorkerHandle::shutdown`] for a clean rendezvous
/// termination.
pub struct WorkerHandle {
    address: String,
    tx: mpsc::Sender<Job>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawns a worker owning `resolver`, draining a bounded queue of
    /// capacity [`QUEUE_BUF_SIZE`].
    pub fn spawn(resolver: Arc<dyn Resolver>) -> Self {
        let address = resolver.address().to_string();
        let (tx, rx) = mpsc::channel(QUEUE_BUF_SIZE);
        let join = tokio::spawn(run_worker(resolver, rx));
        Self {
            address,
            tx,
            join: Some(join),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Submits a lookup job. Fails with [`TunnelError::Closed`] if the
    /// worker has already terminated.
    pub async fn submit(&self, work: Work) -> Result<()> {
        self.tx
            .send(Job::Work(work))
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Sends a shutdown signal and waits for the worker to echo it back
    /// before returning (control + echo rendezvous).
    pub async fn shutdown(&mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Job::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

async fn run_worker(resolver: Arc<dyn Resolver>, mut rx: mpsc::Receiver<Job>) {
    debug!("worker for {} starting", resolver.address());
    while let Some(job) = rx.recv().await {
        match job {
            Job::Work(work) => {
                let result = match work.query_type {
                    QueryType::A => resolver.a(&work.domain).await.map(|(bytes, _rtt)| bytes),
                    QueryType::Txt => resolver.txt(&work.domain).await.map(|(bytes, _rtt)| bytes),
                };
                if work.sink.send(result).is_err() {
                    warn!(
                        "worker for {} could not deliver result: receiver gone",
                        resolver.address()
                    );
                }
            }
            Job::Shutdown(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!("worker for {} terminated", resolver.address());
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoResolver;

    #[async_trait]
    impl Resolver for EchoResolver {
        fn address(&self) -> &str {
            "echo"
        }

        async fn a(&self, fqdn: &str) -> Result<(Vec<u8>, Duration)> {
            Ok((fqdn.as_bytes().to_vec(), Duration::from_millis(1)))
        }

        async fn txt(&self, fqdn: &str) -> Result<(Vec<u8>, Duration)> {
            Ok((fqdn.as_bytes().to_vec(), Duration::from_millis(1)))
        }
    }

    #[tokio::test]
    async fn submitted_work_resolves_through_sink() {
        let worker = WorkerHandle::spawn(Arc::new(EchoResolver));
        let (tx, rx) = oneshot::channel();
        worker
            .submit(Work {
                query_type: QueryType::Txt,
                domain: "abc.c2.example.".to_string(),
                sink: tx,
            })
            .await
            .unwrap();
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, b"abc.c2.example.".to_vec());
    }

    #[tokio::test]
    async fn shutdown_is_a_clean_rendezvous() {
        let mut worker = WorkerHandle::spawn(Arc::new(EchoResolver));
        worker.shutdown().await;
        let (tx, _rx) = oneshot::channel();
        let submitted = worker
            .submit(Work {
                query_type: QueryType::A,
                domain: "x.c2.example.".to_string(),
                sink: tx,
            })
            .await;
        assert!(matches!(submitted, Err(TunnelError::Closed)));
    }
}
