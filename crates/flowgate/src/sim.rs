//! In-memory transport standing in for real sockets, and the scripted
//! traffic that drives it.

use crate::config::TrafficConfig;
use anyhow::Result;
use flowgate_core::{Chunk, Disposition, Engine, FilterError, Rejected, Shutdown, Socket, Transport};
use flowgate_proto::{AddressFamily, Direction, FlowOrigin, SocketInfo, SocketType};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
const RESOLVERS: [IpAddr; 3] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
];

/// Counts what the engine hands back to the socket.
#[derive(Debug, Default)]
pub struct SimTransport {
    name: String,
    sent: AtomicU64,
    received: AtomicU64,
    defunct: AtomicBool,
    write_closed: AtomicBool,
}

impl SimTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Bytes that reached the peer.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes that reached the application.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Relaxed)
    }

    /// Account bytes the engine let through without holding them.
    pub fn deliver(&self, direction: Direction, chunk: &Chunk) {
        let counter = match direction {
            Direction::Outbound => &self.sent,
            Direction::Inbound => &self.received,
        };
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
}

impl Transport for SimTransport {
    fn reinject(&self, direction: Direction, chunk: Chunk) -> Result<(), Rejected> {
        debug!("{}: {} bytes reinjected {}", self.name, chunk.len(), direction);
        self.deliver(direction, &chunk);
        Ok(())
    }

    fn defunct(&self) {
        if !self.defunct.swap(true, Ordering::Relaxed) {
            warn!("{}: connection reset by filter", self.name);
        }
    }

    fn shutdown_write(&self) {
        self.write_closed.store(true, Ordering::Relaxed);
        debug!("{}: write side closed", self.name);
    }
}

/// Totals across every simulated socket.
#[derive(Debug, Default, Serialize)]
pub struct TrafficReport {
    pub offered: u64,
    pub delivered_out: u64,
    pub delivered_in: u64,
    pub reset: usize,
    pub tail_dropped: usize,
}

impl TrafficReport {
    fn absorb(&mut self, transport: &SimTransport) {
        self.delivered_out += transport.sent();
        self.delivered_in += transport.received();
        if transport.is_defunct() {
            self.reset += 1;
        }
    }
}

fn socket_info(socket_type: SocketType, protocol: u8, pid: u32, local: Option<SocketAddr>) -> SocketInfo {
    let uuid = Uuid::new_v4();
    SocketInfo {
        family: AddressFamily::Inet,
        socket_type,
        protocol,
        pid,
        uuid,
        effective_pid: pid,
        effective_uuid: uuid,
        local,
        remote: None,
    }
}

/// Account a send/receive outcome; `false` once the flow refuses data.
fn settle(
    transport: &SimTransport,
    direction: Direction,
    result: Result<Disposition, FilterError>,
    report: &mut TrafficReport,
) -> Result<bool> {
    match result {
        Ok(Disposition::Pass(chunk)) => transport.deliver(direction, &chunk),
        Ok(Disposition::Held) => {}
        Ok(Disposition::TailDropped) => report.tail_dropped += 1,
        Err(FilterError::Dropped) | Err(FilterError::NotConnected) => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    Ok(true)
}

fn finish(socket: &Socket) {
    match socket.shutdown(Shutdown::Write) {
        Ok(()) | Err(FilterError::ShutdownDeferred) | Err(FilterError::NotConnected) => {}
        Err(e) => warn!("Socket {}: shutdown failed: {}", socket.id(), e),
    }
    if !socket.close_wait() {
        warn!("Socket {}: filters did not release in time", socket.id());
    }
    socket.close();
}

fn run_stream(engine: &Engine, index: usize, config: &TrafficConfig, report: &mut TrafficReport) -> Result<()> {
    let transport = Arc::new(SimTransport::new(format!("stream-{}", index)));
    let socket = engine.open_socket(
        socket_info(SocketType::Stream, 6, 1000 + index as u32, None),
        Some("example.com".to_string()),
        transport.clone(),
    );
    let local = SocketAddr::new(CLIENT, 40000 + index as u16);
    let remote = SocketAddr::new(SERVER, 443);
    match socket.attach(Some(local), Some(remote), FlowOrigin::Outgoing)? {
        Some(flow_id) => debug!("Socket {} filtered as {}", socket.id(), flow_id),
        None => debug!("Socket {} is not filtered", socket.id()),
    }

    for seq in 0..config.messages {
        // The second connection eventually asks for something it may not.
        let request = if index == 1 && seq == config.messages / 2 {
            format!("GET /forbidden/{} HTTP/1.1\r\nHost: example.com\r\n\r\n", seq)
        } else {
            format!("GET /item/{} HTTP/1.1\r\nHost: example.com\r\n\r\n", seq)
        };
        report.offered += request.len() as u64;
        let sent = socket.send(Chunk::new(request.into_bytes()), None);
        if !settle(&transport, Direction::Outbound, sent, report)? {
            info!("Socket {} refused after {} messages", socket.id(), seq);
            break;
        }

        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", seq);
        report.offered += response.len() as u64;
        let received = socket.receive(Chunk::new(response.into_bytes()), None);
        if !settle(&transport, Direction::Inbound, received, report)? {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    finish(&socket);
    report.absorb(&transport);
    Ok(())
}

fn run_datagrams(engine: &Engine, config: &TrafficConfig, report: &mut TrafficReport) -> Result<()> {
    let transport = Arc::new(SimTransport::new("datagram"));
    let local = SocketAddr::new(CLIENT, 53000);
    let socket = engine.open_socket(
        socket_info(SocketType::Datagram, 17, 2000, Some(local)),
        None,
        transport.clone(),
    );

    for seq in 0..config.datagrams {
        let resolver = SocketAddr::new(RESOLVERS[seq % RESOLVERS.len()], 53);
        let query = Chunk::new(format!("query-{}.example.com", seq).into_bytes()).with_addr(resolver);
        report.offered += query.len() as u64;
        let sent = socket.send(query, Some(resolver));
        settle(&transport, Direction::Outbound, sent, report)?;

        let answer = Chunk::new(format!("answer-{}", seq).into_bytes()).with_addr(resolver);
        report.offered += answer.len() as u64;
        let received = socket.receive(answer, Some(resolver));
        settle(&transport, Direction::Inbound, received, report)?;
    }
    info!("Datagram socket carried {} flows", socket.flow_ids().len());

    thread::sleep(Duration::from_millis(20));
    finish(&socket);
    report.absorb(&transport);
    Ok(())
}

/// Push the configured traffic through the engine.
pub fn run_traffic(engine: &Engine, config: &TrafficConfig) -> Result<TrafficReport> {
    let mut report = TrafficReport::default();
    for index in 0..config.connections {
        run_stream(engine, index, config, &mut report)?;
    }
    if config.datagrams > 0 {
        run_datagrams(engine, config, &mut report)?;
    }
    Ok(report)
}
