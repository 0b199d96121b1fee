//! Gateway UDP beacon listener.
//!
//! CAN-over-Ethernet gateways announce themselves with small JSON
//! datagrams. Only the manufacturer, product, name and advertised TCP port
//! are consumed; a beacon is trusted for five seconds after receipt.

use std::io;
use std::net::{IpAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace};
use serde::Deserialize;

use crate::retry::ShouldRetry;

/// UDP port the gateway announces itself on.
pub const BEACON_PORT: u16 = 47664;

/// How long a received beacon counts as fresh.
pub const BEACON_FRESHNESS: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct Beacon {
    mfg: String,
    product: String,
    name: String,
    // the gateway serializes the port as a decimal string
    port: String,
}

/// A gateway endpoint assembled from a beacon's source address and its
/// advertised port.
#[derive(Debug, Clone)]
pub struct GatewayEndpoint {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub seen: Instant,
}

impl GatewayEndpoint {
    pub fn is_fresh(&self) -> bool {
        self.seen.elapsed() < BEACON_FRESHNESS
    }
}

fn parse_beacon(datagram: &[u8], ip: IpAddr) -> Option<GatewayEndpoint> {
    let beacon: Beacon = match serde_json::from_slice(datagram) {
        Ok(beacon) => beacon,
        Err(e) => {
            trace!("unparseable beacon from {}: {}", ip, e);
            return None;
        }
    };
    if beacon.mfg != "IDS" {
        trace!("ignoring beacon from manufacturer {:?}", beacon.mfg);
        return None;
    }
    if beacon.product != "CAN_TO_ETHERNET_GATEWAY" {
        trace!("ignoring beacon for product {:?}", beacon.product);
        return None;
    }
    let port: u16 = match beacon.port.parse() {
        Ok(port) if port != 0 => port,
        _ => {
            debug!("beacon from {} advertises an unusable port {:?}", ip, beacon.port);
            return None;
        }
    };
    Some(GatewayEndpoint {
        name: beacon.name,
        ip,
        port,
        seen: Instant::now(),
    })
}

/// Background listener tracking the freshest gateway announcement.
pub struct BeaconListener {
    latest: Arc<Mutex<Option<GatewayEndpoint>>>,
    stop: Arc<AtomicBool>,
    local_port: u16,
    handle: Option<JoinHandle<()>>,
}

impl BeaconListener {
    pub fn start() -> io::Result<BeaconListener> {
        Self::bind(BEACON_PORT)
    }

    fn bind(port: u16) -> io::Result<BeaconListener> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let local_port = socket.local_addr()?.port();

        let latest = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_latest = latest.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("idscan-beacon".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                while !thread_stop.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf) {
                        Ok((n, peer)) => {
                            if let Some(endpoint) = parse_beacon(&buf[..n], peer.ip()) {
                                trace!("gateway {:?} at {}:{}", endpoint.name, endpoint.ip, endpoint.port);
                                *thread_latest.lock().unwrap() = Some(endpoint);
                            }
                        }
                        Err(ref e) if e.should_retry() => {}
                        Err(e) => debug!("beacon receive failed: {}", e),
                    }
                }
            })
            .expect("spawning the beacon thread");

        Ok(BeaconListener {
            latest,
            stop,
            local_port,
            handle: Some(handle),
        })
    }

    /// Port the listener is bound to; fixed in production, ephemeral in
    /// tests.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The freshest known gateway, if any beacon arrived within the last
    /// five seconds.
    pub fn latest(&self) -> Option<GatewayEndpoint> {
        self.latest
            .lock()
            .unwrap()
            .clone()
            .filter(GatewayEndpoint::is_fresh)
    }

    /// Blocks until a fresh beacon shows up or `timeout` passes.
    pub fn wait_for_gateway(&self, timeout: Duration) -> Option<GatewayEndpoint> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(endpoint) = self.latest() {
                return Some(endpoint);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
