//! Executes single scan units against the network.
//!
//! Every outcome, including transport failures, comes back as a
//! [`ProbeResult`]; nothing is raised past [`Probe::probe`].
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::num::NonZero;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use surge_ping::SurgeError;
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::{self, Instant},
};

use crate::error::ProbeError;
use crate::model::{ProbeResult, ProbeStatus, Protocol, ScanUnit};
use crate::services::expects_http_request;

const HTTP_PROBE: &[u8] = b"HEAD / HTTP/1.0\r\n\r\n";
const ICMP_PAYLOAD: [u8; 56] = [0; 56];

/// Executes one scan unit and classifies the outcome.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, unit: &ScanUnit) -> ProbeResult;
}

/// Probes over real sockets: TCP connect, UDP datagrams and ICMP echo.
#[derive(Debug, Clone)]
pub struct ProbeEngine {
    timeout: Duration,
    banner_timeout: Duration,
    tries: NonZero<u8>,
    grab_banners: bool,
}

impl ProbeEngine {
    /// `tries` of 0 is corrected to 1.
    pub fn new(timeout: Duration, banner_timeout: Duration, tries: u8, grab_banners: bool) -> Self {
        Self {
            timeout,
            banner_timeout,
            tries: NonZero::new(tries).unwrap_or(NonZero::<u8>::MIN),
            grab_banners,
        }
    }

    /// Connects up to `self.tries` times.
    ///
    /// A completed handshake is open, an active refusal is closed and a
    /// handshake that neither completes nor is refused within the timeout
    /// is filtered. Only silence is retried.
    async fn tcp(&self, unit: &ScanUnit) -> ProbeResult {
        let socket = unit.socket();
        let started = Instant::now();

        for nr_try in 1..=self.tries.get() {
            match self.connect(socket).await {
                Ok(Ok(mut stream)) => {
                    debug!("Connection was successful to {socket} after {nr_try} tries");
                    let latency = started.elapsed();
                    let banner = if self.grab_banners {
                        self.grab_banner(&mut stream, socket.port()).await
                    } else {
                        None
                    };
                    if let Err(e) = stream.shutdown().await {
                        debug!("Shutdown stream error {e}");
                    }
                    return ProbeResult::new(unit, ProbeStatus::Open, latency).with_banner(banner);
                }
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                    return ProbeResult::new(unit, ProbeStatus::Closed, started.elapsed());
                }
                Ok(Err(e)) => return error_result(unit, started, classify_io(e)),
                Err(_) => debug!("Connection to {socket} timed out, try {nr_try}"),
            }
        }

        ProbeResult::new(unit, ProbeStatus::Filtered, started.elapsed())
            .with_cause(format!("no answer within {:?}", self.timeout))
    }

    /// Performs the connection to the socket with timeout.
    async fn connect(&self, socket: SocketAddr) -> Result<io::Result<TcpStream>, time::error::Elapsed> {
        time::timeout(self.timeout, TcpStream::connect(socket)).await
    }

    /// Reads whatever the service volunteers within the banner timeout.
    /// HTTP-like ports get a `HEAD` request first.
    async fn grab_banner(&self, stream: &mut TcpStream, port: u16) -> Option<String> {
        if expects_http_request(port) {
            time::timeout(self.banner_timeout, stream.write_all(HTTP_PROBE))
                .await
                .ok()?
                .ok()?;
        }

        let mut buf = [0u8; 1024];
        let size = time::timeout(self.banner_timeout, stream.read(&mut buf))
            .await
            .ok()?
            .ok()?;
        let banner = String::from_utf8_lossy(&buf[..size]).trim().to_owned();

        (!banner.is_empty()).then_some(banner)
    }

    /// Sends a protocol specific payload and waits for any answer.
    async fn udp(&self, unit: &ScanUnit) -> ProbeResult {
        let socket = unit.socket();
        let payload = udp_payload(socket.port());
        let started = Instant::now();

        for nr_try in 1..=self.tries.get() {
            match self.udp_scan(socket, &payload).await {
                Ok(Some(size)) => {
                    debug!("Received {size} bytes from {socket}");
                    return ProbeResult::new(unit, ProbeStatus::Open, started.elapsed());
                }
                Ok(None) => debug!("No UDP answer from {socket}, try {nr_try}"),
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    return ProbeResult::new(unit, ProbeStatus::Closed, started.elapsed());
                }
                Err(e) => return error_result(unit, started, classify_io(e)),
            }
        }

        ProbeResult::new(unit, ProbeStatus::Timeout, started.elapsed())
            .with_cause(format!("no answer within {:?}", self.timeout))
    }

    /// `Ok(None)` when nothing came back before the timeout.
    async fn udp_scan(&self, socket: SocketAddr, payload: &[u8]) -> io::Result<Option<usize>> {
        let local_addr = match socket {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let udp_socket = UdpSocket::bind(local_addr).await?;
        udp_socket.connect(socket).await?;
        udp_socket.send(payload).await?;

        let mut buf = [0u8; 1024];
        match time::timeout(self.timeout, udp_socket.recv(&mut buf)).await {
            Ok(Ok(size)) => Ok(Some(size)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn icmp(&self, unit: &ScanUnit) -> ProbeResult {
        let address = unit.target.address;
        let started = Instant::now();

        match time::timeout(self.timeout, surge_ping::ping(address, &ICMP_PAYLOAD)).await {
            Ok(Ok((_packet, rtt))) => ProbeResult::new(unit, ProbeStatus::Open, rtt),
            Ok(Err(SurgeError::Timeout { .. })) | Err(_) => {
                ProbeResult::new(unit, ProbeStatus::Timeout, started.elapsed())
                    .with_cause("no echo reply")
            }
            Ok(Err(e)) => error_result(unit, started, ProbeError::Icmp(e.to_string())),
        }
    }
}

#[async_trait]
impl Probe for ProbeEngine {
    async fn probe(&self, unit: &ScanUnit) -> ProbeResult {
        match unit.protocol {
            Protocol::Tcp => self.tcp(unit).await,
            Protocol::Udp => self.udp(unit).await,
            Protocol::Icmp => self.icmp(unit).await,
        }
    }
}

fn classify_io(e: io::Error) -> ProbeError {
    if e.to_string().to_lowercase().contains("too many open files") {
        warn!("Too many open files. Please reduce the number of workers or raise the ulimit.");
        ProbeError::TooManyOpenFiles
    } else {
        ProbeError::Io(e)
    }
}

fn error_result(unit: &ScanUnit, started: Instant, error: ProbeError) -> ProbeResult {
    debug!("Probe of {unit} failed: {error}");
    ProbeResult::new(unit, ProbeStatus::Error, started.elapsed()).with_cause(error.to_string())
}

/// Payload most likely to provoke an answer from the service on `port`.
fn udp_payload(port: u16) -> Vec<u8> {
    match port {
        // DNS query for the root NS records
        53 => vec![
            0x13, 0x37, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x02, 0x00, 0x01,
        ],
        // NTP v3 client request
        123 => {
            let mut packet = vec![0u8; 48];
            packet[0] = 0x1b;
            packet
        }
        // SNMPv1 get-request, community "public", sysDescr.0
        161 => vec![
            0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, 0x70, 0x75, 0x62, 0x6c, 0x69, 0x63, 0xa0,
            0x19, 0x02, 0x01, 0x01, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30, 0x0c,
            0x06, 0x08, 0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
        ],
        _ => Vec::new(),
    }
}
