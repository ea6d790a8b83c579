//! Resolver probing: RTT measurement, corruption detection, and alphabet
//! tolerance classification.

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use rand::RngCore;

use crate::encoding::{Base32Encoder, Base58Encoder, Encoder};
use crate::error::{Result, TunnelError};
use crate::framer::{join_subdata, subdata_space, DnsMessage, MessageType};
use crate::ids::msg_id;
use crate::resolver::Resolver;

pub const METRICS_MAX: usize = 8;
const PROBE_COUNT: usize = METRICS_MAX / 2;

/// Per-resolver fingerprint state. Written exactly once during `init`'s
/// fingerprinting phase; read-only (except worker-local `metrics` updates)
/// for the rest of the session's lifetime.
#[derive(Debug, Clone)]
pub struct ResolverMetadata {
    pub address: String,
    pub enable_base58: bool,
    pub metrics: VecDeque<Duration>,
    pub errors: u32,
}

impl ResolverMetadata {
    pub fn new(address: String) -> Self {
        Self {
            address,
            enable_base58: false,
            metrics: VecDeque::new(),
            errors: 0,
        }
    }

    /// Prepends `rtt`, keeping only the newest [`METRICS_MAX`] samples.
    pub fn record_metrics(&mut self, rtt: Duration) {
        self.metrics.push_front(rtt);
        self.metrics.truncate(METRICS_MAX);
    }

    /// Arithmetic mean of the samples, rounded down; zero if empty.
    pub fn average_rtt(&self) -> Duration {
        if self.metrics.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.metrics.iter().sum();
        total / self.metrics.len() as u32
    }
}

/// Probes `resolver` with both alphabets (unless `force_base32`), filling
/// in a [`ResolverMetadata`].
pub async fn fingerprint_resolver(
    resolver: &dyn Resolver,
    parent: &str,
    dns_session_id: u32,
    worker_id: u32,
    force_base32: bool,
) -> ResolverMetadata {
    let mut meta = ResolverMetadata::new(resolver.address().to_string());

    let base32 = Base32Encoder;
    benchmark(&base32, resolver, parent, dns_session_id, worker_id, &mut meta).await;

    if meta.errors == 0 && !force_base32 {
        let base58 = Base58Encoder;
        benchmark(&base58, resolver, parent, dns_session_id, worker_id, &mut meta).await;
        if meta.errors == 0 {
            meta.enable_base58 = true;
        } else {
            meta.enable_base58 = false;
            meta.errors = 0;
        }
    }

    meta
}

/// Runs `fingerprint_resolver` concurrently across every configured
/// resolver and returns one [`ResolverMetadata`] per resolver, in input
/// order.
pub async fn fingerprint_all(
    resolvers: &[std::sync::Arc<dyn Resolver>],
    parent: &str,
    dns_session_id: u32,
    force_base32: bool,
) -> Vec<ResolverMetadata> {
    let tasks = resolvers.iter().enumerate().map(|(i, r)| {
        fingerprint_resolver(r.as_ref(), parent, dns_session_id, i as u32, force_base32)
    });
    join_all(tasks).await
}

/// Issues `metrics_max/2` probes with `encoder`, each a `NOP` message with
/// a fresh random payload, checked via a CRC-32 echo.
async fn benchmark(
    encoder: &dyn Encoder,
    resolver: &dyn Resolver,
    parent: &str,
    dns_session_id: u32,
    worker_id: u32,
    meta: &mut ResolverMetadata,
) {
    let space = subdata_space(parent);
    let mut rng = rand::thread_rng();

    for _ in 0..PROBE_COUNT {
        let mut payload = [0u8; 8];
        rng.fill_bytes(&mut payload);

        let mut msg = DnsMessage::new(MessageType::Nop);
        msg.id = msg_id(worker_id, dns_session_id);
        msg.data = payload.to_vec();

        let serialized = msg.encode();
        let checksum = crc32fast::hash(&serialized);

        let encoded = encoder.encode(&serialized);
        let fqdn = match join_subdata(&encoded, parent, space) {
            Ok(f) => f,
            Err(_) => {
                meta.errors += 1;
                continue;
            }
        };

        match resolver.a(&fqdn).await {
            Ok((answer, rtt)) => {
                if answer.len() != 4 {
                    warn!("resolver {} returned malformed probe answer", resolver.address());
                    meta.errors += 1;
                    continue;
                }
                let echoed = u32::from_le_bytes([answer[0], answer[1], answer[2], answer[3]]);
                if echoed != checksum {
                    debug!(
                        "resolver {} failed checksum probe with {}",
                        resolver.address(),
                        encoder.name()
                    );
                    meta.errors += 1;
                } else {
                    meta.record_metrics(rtt);
                }
            }
            Err(TunnelError::Timeout) => meta.errors += 1,
            Err(_) => meta.errors += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeResolver {
        addr: String,
        fail_base58: bool,
        calls: AtomicU32,
        last_checksum: Mutex<Option<u32>>,
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        fn address(&self) -> &str {
            &self.addr
        }

        async fn a(&self, fqdn: &str) -> Result<(Vec<u8>, Duration)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Decode using whichever alphabet matches the label content;
            // this fake only needs to recover the checksum we embedded.
            let label = fqdn.split('.').next().unwrap_or("");
            let looks_base58 = label.bytes().any(|b| b.is_ascii_uppercase());
            if looks_base58 && self.fail_base58 {
                return Ok((vec![0, 0, 0, 0], Duration::from_millis(1)));
            }
            let decoded = if looks_base58 {
                bs58::decode(label).into_vec().map_err(|_| TunnelError::InvalidResponse)?
            } else {
                crate::encoding::Base32Encoder.decode(label.as_bytes())
                    .map_err(|_| TunnelError::InvalidResponse)?
            };
            let checksum = crc32fast::hash(&decoded);
            *self.last_checksum.lock().unwrap() = Some(checksum);
            Ok((checksum.to_le_bytes().to_vec(), Duration::from_millis(5)))
        }

        async fn txt(&self, _fqdn: &str) -> Result<(Vec<u8>, Duration)> {
            unimplemented!("not used by fingerprinting")
        }
    }

    #[tokio::test]
    async fn successful_probe_enables_base58_and_clears_errors() {
        let resolver = FakeResolver {
            addr: "10.0.0.1".to_string(),
            fail_base58: false,
            calls: AtomicU32::new(0),
            last_checksum: Mutex::new(None),
        };
        let meta = fingerprint_resolver(&resolver, "c2.example.", 0x00561234, 0, false).await;
        assert_eq!(meta.errors, 0);
        assert!(meta.enable_base58);
        // Both the base32 and base58 benchmarks record into the same
        // metadata, so a resolver that passes both probes ends up with the
        // full METRICS_MAX window (PROBE_COUNT from each alphabet).
        assert_eq!(meta.metrics.len(), METRICS_MAX);
    }

    #[tokio::test]
    async fn base58_corruption_disables_it_without_failing_base32() {
        let resolver = FakeResolver {
            addr: "10.0.0.2".to_string(),
            fail_base58: true,
            calls: AtomicU32::new(0),
            last_checksum: Mutex::new(None),
        };
        let meta = fingerprint_resolver(&resolver, "c2.example.", 0x00561234, 0, false).await;
        assert_eq!(meta.errors, 0);
        assert!(!meta.enable_base58);
    }

    #[test]
    fn record_metrics_keeps_newest_first_bounded() {
        let mut meta = ResolverMetadata::new("x".into());
        for i in 0..12u64 {
            meta.record_metrics(Duration::from_millis(i));
        }
        assert_eq!(meta.metrics.len(), METRICS_MAX);
        assert_eq!(meta.metrics[0], Duration::from_millis(11));
    }

    #[test]
    fn average_rtt_is_zero_when_empty() {
        let meta = ResolverMetadata::new("x".into());
        assert_eq!(meta.average_rtt(), Duration::ZERO);
    }
}
