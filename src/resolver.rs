//! The resolver collaborator: raw DNS wire queries over UDP, with the
//! session's retry/timeout policy applied internally.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Result, TunnelError};

const QTYPE_A: u16 = 1;
const QTYPE_TXT: u16 = 16;
const QCLASS_IN: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Txt,
}

/// `A(fqdn) -> (payload, rtt)` and `TXT(fqdn) -> (payload, rtt)`. Errors are
/// already folded into `TunnelError` by the time they cross this boundary;
/// retries and timeouts are the resolver's own responsibility.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Stable identity used as the `ResolverMetadata` map key.
    fn address(&self) -> &str;

    async fn a(&self, fqdn: &str) -> Result<(Vec<u8>, Duration)>;
    async fn txt(&self, fqdn: &str) -> Result<(Vec<u8>, Duration)>;
}

/// Retry/timeout policy shared by every query this resolver issues.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_wait: Duration,
    pub query_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_wait: Duration::from_millis(200),
            query_timeout: Duration::from_secs(2),
        }
    }
}

/// A resolver reached over a connected UDP socket, speaking raw DNS wire
/// format by hand (no resolver library).
pub struct UdpResolver {
    addr: SocketAddr,
    label: String,
    policy: RetryPolicy,
}

impl UdpResolver {
    pub fn new(addr: SocketAddr, policy: RetryPolicy) -> Self {
        Self {
            label: addr.to_string(),
            addr,
            policy,
        }
    }

    async fn query(&self, fqdn: &str, qtype: QueryType) -> Result<(Vec<u8>, Duration)> {
        let mut last_err = TunnelError::Timeout;

        for attempt in 0..=self.policy.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.policy.retry_wait).await;
            }

            let started = tokio::time::Instant::now();
            match timeout(self.policy.query_timeout, self.send_once(fqdn, qtype)).await {
                Ok(Ok(payload)) => {
                    let rtt = started.elapsed();
                    debug!("resolver {} answered in {:?}", self.label, rtt);
                    return Ok((payload, rtt));
                }
                Ok(Err(e)) => {
                    warn!("resolver {} query failed (attempt {attempt}): {e}", self.label);
                    last_err = e;
                }
                Err(_) => {
                    warn!("resolver {} query timed out (attempt {attempt})", self.label);
                    last_err = TunnelError::Timeout;
                }
            }
        }

        Err(last_err)
    }

    async fn send_once(&self, fqdn: &str, qtype: QueryType) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.addr).await?;

        let txid: u16 = rand::thread_rng().gen();
        let query = build_query(txid, fqdn, qtype)?;
        socket.send(&query).await?;

        let mut buf = vec![0u8; 4096];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);

        parse_answer(&buf, txid, qtype)
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    fn address(&self) -> &str {
        &self.label
    }

    async fn a(&self, fqdn: &str) -> Result<(Vec<u8>, Duration)> {
        self.query(fqdn, QueryType::A).await
    }

    async fn txt(&self, fqdn: &str) -> Result<(Vec<u8>, Duration)> {
        self.query(fqdn, QueryType::Txt).await
    }
}

fn write_qname(buf: &mut BytesMut, fqdn: &str) -> Result<()> {
    for label in fqdn.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > crate::framer::LABEL_LEN {
            return Err(TunnelError::MsgTooLong);
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

fn build_query(txid: u16, fqdn: &str, qtype: QueryType) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(fqdn.len() + 32);
    buf.put_u16(txid);
    buf.put_u16(0x0100); // standard query, recursion desired
    buf.put_u16(1); // qdcount
    buf.put_u16(0); // ancount
    buf.put_u16(0); // nscount
    buf.put_u16(0); // arcount

    write_qname(&mut buf, fqdn)?;
    buf.put_u16(match qtype {
        QueryType::A => QTYPE_A,
        QueryType::Txt => QTYPE_TXT,
    });
    buf.put_u16(QCLASS_IN);

    Ok(buf.to_vec())
}

/// Skips a (possibly compressed) domain name, returning the index just
/// past it.
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        if pos >= packet.len() {
            return Err(TunnelError::InvalidResponse);
        }
        let len = packet[pos];
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Ok(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

fn parse_answer(packet: &[u8], txid: u16, qtype: QueryType) -> Result<Vec<u8>> {
    if packet.len() < 12 {
        return Err(TunnelError::InvalidResponse);
    }
    let mut header = &packet[0..12];
    let resp_id = header.get_u16();
    if resp_id != txid {
        return Err(TunnelError::InvalidResponse);
    }
    let flags = header.get_u16();
    let rcode = flags & 0x000F;
    if rcode != 0 {
        return Err(TunnelError::InvalidResponse);
    }
    let qdcount = header.get_u16();
    let ancount = header.get_u16();

    let mut pos = 12usize;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos += 4; // qtype + qclass
    }

    if ancount == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            return Err(TunnelError::InvalidResponse);
        }
        let mut rr_header = &packet[pos..pos + 10];
        let rtype = rr_header.get_u16();
        let _rclass = rr_header.get_u16();
        let _ttl = rr_header.get_u32();
        let rdlen = rr_header.get_u16() as usize;
        pos += 10;
        if pos + rdlen > packet.len() {
            return Err(TunnelError::InvalidResponse);
        }
        let rdata = &packet[pos..pos + rdlen];
        pos += rdlen;

        match qtype {
            QueryType::A => {
                if rtype == QTYPE_A && rdata.len() == 4 {
                    out.extend_from_slice(rdata);
                }
            }
            QueryType::Txt => {
                if rtype == QTYPE_TXT {
                    let mut cursor = rdata;
                    while !cursor.is_empty() {
                        let seg_len = cursor[0] as usize;
                        cursor = &cursor[1..];
                        if seg_len > cursor.len() {
                            return Err(TunnelError::InvalidResponse);
                        }
                        out.extend_from_slice(&cursor[..seg_len]);
                        cursor = &cursor[seg_len..];
                    }
                }
            }
        }
    }

    Ok(out)
}
