//! CAN-over-Ethernet gateway transport.
//!
//! One TCP socket per transport. A dedicated reader thread owns the
//! inbound half and keeps the connection alive: read timeouts are normal,
//! EOF and I/O errors mark the transport disconnected, and the next loop
//! iteration redials after a short backoff without spawning a new thread.
//! Writes go through a mutex-guarded clone of the socket, so frames from
//! concurrent senders reach the wire whole and in submission order.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, trace};

use crate::cobs::{self, CobsDecoder};
use crate::frame::CanFrame;
use crate::retry::ShouldRetry;
use crate::transport::{
    FrameHandler, Transport, TransportError, CONNECT_TIMEOUT, READ_TIMEOUT, RECONNECT_BACKOFF,
};
use crate::util;

pub struct TcpTransport {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    host: String,
    port: u16,
    writer: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    should_stop: AtomicBool,
    handler: FrameHandler,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, handler: FrameHandler) -> TcpTransport {
        TcpTransport {
            shared: Arc::new(Shared {
                host: host.to_string(),
                port,
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                handler,
            }),
            reader: Mutex::new(None),
        }
    }
}

impl Shared {
    fn dial(&self) -> Result<TcpStream, TransportError> {
        let addr: SocketAddr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(TransportError::Connect)?
            .next()
            .ok_or_else(|| {
                TransportError::Connect(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host resolved to no address",
                ))
            })?;
        let stream =
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(TransportError::Connect)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        util::set_socket_option(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &(1 as libc::c_int),
        )?;
        Ok(stream)
    }

    /// Replaces the socket after a drop. Returns the reader-side handle;
    /// the writer slot gets its own clone of the same socket.
    fn reconnect(&self) -> Result<TcpStream, TransportError> {
        let stream = self.dial()?;
        *self.writer.lock().unwrap() = Some(stream.try_clone()?);
        self.connected.store(true, Ordering::SeqCst);
        Ok(stream)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().unwrap() = None;
    }

    /// Reconnect pause, sliced so `close` does not have to wait it out.
    fn backoff(&self) {
        let slice = Duration::from_millis(100);
        let mut waited = Duration::from_millis(0);
        while waited < RECONNECT_BACKOFF && !self.should_stop.load(Ordering::SeqCst) {
            std::thread::sleep(slice);
            waited += slice;
        }
    }
}

fn reader_loop(shared: Arc<Shared>, initial: TcpStream) {
    let mut stream = Some(initial);
    let mut decoder = CobsDecoder::new();
    let mut buf = [0u8; 1024];

    while !shared.should_stop.load(Ordering::SeqCst) {
        if !shared.connected.load(Ordering::SeqCst) {
            stream = None;
            shared.backoff();
            if shared.should_stop.load(Ordering::SeqCst) {
                break;
            }
            match shared.reconnect() {
                Ok(new_stream) => {
                    info!("reconnected to gateway {}:{}", shared.host, shared.port);
                    decoder.reset();
                    stream = Some(new_stream);
                }
                Err(e) => debug!("gateway reconnect failed: {}", e),
            }
            continue;
        }

        let s = match stream.as_mut() {
            Some(s) => s,
            None => {
                shared.mark_disconnected();
                continue;
            }
        };

        match s.read(&mut buf) {
            // EOF on a stream socket means the gateway went away
            Ok(0) => {
                debug!("gateway closed the stream");
                shared.mark_disconnected();
            }
            Ok(n) => {
                for payload in decoder.decode_bytes(&buf[..n]) {
                    match CanFrame::unmarshal(&payload) {
                        Ok(frame) => (shared.handler)(frame),
                        Err(e) => trace!("dropping inbound frame: {}", e),
                    }
                }
            }
            Err(ref e) if e.should_retry() => {}
            Err(e) => {
                debug!("gateway read failed: {}", e);
                shared.mark_disconnected();
            }
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> Result<(), TransportError> {
        if self.shared.should_stop.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let stream = self.shared.reconnect()?;
        let mut reader = self.reader.lock().unwrap();
        if reader.is_none() {
            let shared = self.shared.clone();
            *reader = Some(
                std::thread::Builder::new()
                    .name("idscan-tcp-reader".into())
                    .spawn(move || reader_loop(shared, stream))
                    .expect("spawning the reader thread"),
            );
        }
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let mut writer = self.shared.writer.lock().unwrap();
        let stream = match writer.as_mut() {
            Some(s) => s,
            None => return Err(TransportError::NotConnected),
        };
        let encoded = cobs::encode(&frame.marshal());
        if let Err(e) = stream.write_all(&encoded) {
            *writer = None;
            self.shared.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.shared.should_stop.store(true, Ordering::SeqCst);
        if let Some(stream) = self.shared.writer.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanId;
    use crossbeam::channel::unbounded;
    use std::net::TcpListener;

    fn frame(id: u16, data: &[u8]) -> CanFrame {
        CanFrame::new(CanId::Standard(id), data).unwrap()
    }

    #[test]
    fn inbound_frames_reach_the_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, rx) = unbounded();
        let transport = TcpTransport::new(
            "127.0.0.1",
            port,
            Box::new(move |frame| tx.send(frame).unwrap()),
        );
        transport.connect().unwrap();
        assert!(transport.is_connected());

        let (mut server, _) = listener.accept().unwrap();
        let sent = frame(0x35c, &[0x01, 0x02]);
        server.write_all(&cobs::encode(&sent.marshal())).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, sent);
        transport.close();
        assert!(!transport.is_connected());
    }

    #[test]
    fn outbound_frames_are_framed_and_checksummed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = TcpTransport::new("127.0.0.1", port, Box::new(|_| {}));
        transport.connect().unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let sent = frame(0x123, &[0xaa, 0x00, 0xbb]);
        transport.send(&sent).unwrap();

        let mut decoder = CobsDecoder::new();
        let mut buf = [0u8; 256];
        let mut frames = Vec::new();
        while frames.is_empty() {
            let n = server.read(&mut buf).unwrap();
            for payload in decoder.decode_bytes(&buf[..n]) {
                if !payload.is_empty() {
                    frames.push(CanFrame::unmarshal(&payload).unwrap());
                }
            }
        }
        assert_eq!(frames, vec![sent]);
        transport.close();
    }

    #[test]
    fn concurrent_senders_do_not_interleave() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = Arc::new(TcpTransport::new("127.0.0.1", port, Box::new(|_| {})));
        transport.connect().unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let threads: Vec<_> = (0..8u8)
            .map(|i| {
                let transport = transport.clone();
                std::thread::spawn(move || {
                    for j in 0..16u8 {
                        transport
                            .send(&frame(0x100 + i as u16, &[i, j, 0x00, j]))
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut decoder = CobsDecoder::new();
        let mut buf = [0u8; 1024];
        let mut count = 0;
        while count < 8 * 16 {
            let n = server.read(&mut buf).unwrap();
            for payload in decoder.decode_bytes(&buf[..n]) {
                if payload.is_empty() {
                    continue;
                }
                let frame = CanFrame::unmarshal(&payload).unwrap();
                let data = frame.data();
                assert_eq!(data.len(), 4);
                assert_eq!(data[1], data[3]);
                count += 1;
            }
        }
        transport.close();
    }

    #[test]
    fn send_without_connection_fails() {
        let transport = TcpTransport::new("127.0.0.1", 1, Box::new(|_| {}));
        assert!(matches!(
            transport.send(&frame(0x1, &[])),
            Err(TransportError::NotConnected)
        ));
    }
}
