//! Wall-clock source for stamping a cycle.
//!
//! Two variants, picked once from config: a small SNTPv4 client (RFC 4330)
//! over UDP, or the network session's own clock.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use time::OffsetDateTime;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::retry::{retry, RetryPolicy};
use crate::transport::NetworkSession;

/// Seconds between the NTP era-0 epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const PACKET_LEN: usize = 48;
/// LI = 0 (no warning), VN = 4, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0b00_100_011;
const MODE_SERVER: u8 = 4;
const ORIGIN_OFFSET: usize = 24;
const TRANSMIT_OFFSET: usize = 40;
/// Era-0 seconds below this have wrapped past 2036-02-07.
const ERA_PIVOT: u64 = 0x8000_0000;

pub enum TimeSource {
    Ntp(SntpClient),
    Session,
}

impl TimeSource {
    /// Seconds since the Unix epoch.
    pub async fn now<S: NetworkSession>(&self, session: &S) -> Result<i64> {
        match self {
            Self::Ntp(client) => client.now().await,
            Self::Session => {
                let ms = session
                    .now_millis()
                    .context("network session has no wall clock")?;
                Ok(ms.div_euclid(1000))
            }
        }
    }
}

pub struct SntpClient {
    server: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl SntpClient {
    pub fn new(server: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            server: server.into(),
            timeout,
            retry,
        }
    }

    /// Poll the server until a fresh timestamp arrives or the retry policy
    /// gives up.  Every attempt sends a new request.
    pub async fn now(&self) -> Result<i64> {
        retry("time sync", &self.retry, || self.query()).await
    }

    async fn query(&self) -> Result<i64> {
        let server = lookup_host(self.server.as_str())
            .await
            .with_context(|| format!("failed to resolve ntp server {}", self.server))?
            .next()
            .with_context(|| format!("ntp server {} has no address", self.server))?;
        let socket = UdpSocket::bind(local_addr_for(&server))
            .await
            .context("failed to bind udp socket")?;
        socket.connect(server).await?;

        let nonce = request_stamp(OffsetDateTime::now_utc());
        socket.send(&build_request(nonce)).await?;

        let mut buf = [0u8; PACKET_LEN];
        let n = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .with_context(|| format!("no reply from {} within {:?}", self.server, self.timeout))??;

        let ts = parse_response(&buf[..n], nonce)?;
        debug!(server = %self.server, ts, "sntp reply");
        Ok(ts)
    }
}

/// Wildcard bind address in the same family as `server`.
fn local_addr_for(server: &SocketAddr) -> SocketAddr {
    match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// Local time as a 64-bit NTP stamp, used only to pair a reply with its
/// request.  The low bit is forced on so the stamp is never zero.
fn request_stamp(now: OffsetDateTime) -> u64 {
    let secs = (now.unix_timestamp() as u64).wrapping_add(NTP_UNIX_OFFSET) as u32 as u64;
    let frac = ((now.nanosecond() as u64) << 32) / 1_000_000_000;
    (secs << 32 | frac) | 1
}

fn build_request(nonce: u64) -> [u8; PACKET_LEN] {
    let mut pkt = [0u8; PACKET_LEN];
    pkt[0] = CLIENT_HEADER;
    pkt[TRANSMIT_OFFSET..].copy_from_slice(&nonce.to_be_bytes());
    pkt
}

/// Validate a server reply to the request stamped `nonce` and return its
/// transmit time in Unix seconds.
fn parse_response(pkt: &[u8], nonce: u64) -> Result<i64> {
    ensure!(pkt.len() >= PACKET_LEN, "short ntp reply: {} bytes", pkt.len());

    let leap = pkt[0] >> 6;
    let mode = pkt[0] & 0b111;
    let stratum = pkt[1];

    ensure!(mode == MODE_SERVER, "unexpected ntp mode {mode}");

    let mut origin = [0u8; 8];
    origin.copy_from_slice(&pkt[ORIGIN_OFFSET..ORIGIN_OFFSET + 8]);
    ensure!(
        u64::from_be_bytes(origin) == nonce,
        "ntp reply does not answer our request"
    );

    if stratum == 0 {
        let code = String::from_utf8_lossy(&pkt[12..16]);
        bail!("ntp kiss-o'-death: {code}");
    }
    ensure!(stratum <= 15, "ntp stratum {stratum} out of range");
    ensure!(leap != 3, "ntp server clock not synchronised");

    let secs = u32::from_be_bytes([
        pkt[TRANSMIT_OFFSET],
        pkt[TRANSMIT_OFFSET + 1],
        pkt[TRANSMIT_OFFSET + 2],
        pkt[TRANSMIT_OFFSET + 3],
    ]) as u64;
    ensure!(secs != 0, "ntp reply has an empty transmit timestamp");

    let secs = if secs < ERA_PIVOT { secs + (1 << 32) } else { secs };
    ensure!(
        secs >= NTP_UNIX_OFFSET,
        "ntp transmit timestamp {secs} predates the unix epoch"
    );
    Ok((secs - NTP_UNIX_OFFSET) as i64)
}

// ===========================================================================
// Tests
// ===========================================================================
