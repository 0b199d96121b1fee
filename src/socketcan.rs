//! Raw Linux SocketCAN channel.
//!
//! The kernel exposes CAN interfaces through a network-like API (see
//! https://www.kernel.org/doc/Documentation/networking/can.txt). This
//! module wraps the libc calls and adapts kernel frames to [`CanFrame`],
//! and provides the SocketCAN flavor of [`Transport`]. No receive filters
//! are installed; the bus is observed in full.

use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use libc::{c_int, c_short};
use log::{debug, info, trace};

use crate::frame::{CanFrame, CanId, FrameError};
use crate::retry::ShouldRetry;
use crate::transport::{FrameHandler, Transport, TransportError, READ_TIMEOUT, RECONNECT_BACKOFF};
use crate::util;

// constants stolen from C headers
const AF_CAN: c_int = 29;
const PF_CAN: c_int = 29;
const CAN_RAW: c_int = 1;

#[derive(Debug)]
#[repr(C, align(8))]
struct CanAddr {
    af_can: c_short,
    if_index: c_int,
}

impl CanAddr {
    fn new(interface_index: u32) -> Self {
        Self {
            af_can: AF_CAN as c_short,
            if_index: interface_index as c_int,
        }
    }
}

/// Kernel `can_frame`.
///
/// Uses the same memory layout as the underlying kernel struct so it can be
/// passed to `read`/`write` directly.
#[derive(Debug, Copy, Clone)]
#[repr(C, align(8))]
struct KernelFrame {
    /// 32 bit CAN_ID + EFF flag
    id: u32,
    /// data length. Bytes beyond are not valid
    data_len: u8,
    /// padding
    pad: u8,
    /// reserved
    res0: u8,
    /// reserved
    res1: u8,
    /// buffer for data
    data: [u8; 8],
}

impl Default for KernelFrame {
    fn default() -> Self {
        Self {
            id: 0,
            data_len: 0,
            pad: 0,
            res0: 0,
            res1: 0,
            data: [0; 8],
        }
    }
}

impl KernelFrame {
    fn from_frame(frame: &CanFrame) -> KernelFrame {
        let mut kernel = KernelFrame::default();
        kernel.id = frame.id().to_wire();
        kernel.data_len = frame.len() as u8;
        kernel.data[..frame.len()].copy_from_slice(frame.data());
        kernel
    }

    fn to_frame(&self) -> Result<CanFrame, FrameError> {
        let len = (self.data_len as usize).min(8);
        CanFrame::new(CanId::from_wire(self.id), &self.data[..len])
    }
}

/// A bound raw CAN socket.
pub struct RawCanSocket {
    fd: RawFd,
}

impl RawCanSocket {
    pub fn open(interface_name: &str) -> Result<Self, TransportError> {
        let interface_index = nix::net::if_::if_nametoindex(interface_name)
            .map_err(|e| TransportError::Connect(io::Error::new(io::ErrorKind::NotFound, e)))?;
        let sock_fd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };

        if sock_fd == -1 {
            return Err(TransportError::Connect(io::Error::last_os_error()));
        }

        let bind_result = unsafe {
            let addr = CanAddr::new(interface_index);
            let sockaddr_ptr = &addr as *const CanAddr;
            libc::bind(
                sock_fd,
                sockaddr_ptr as *const libc::sockaddr,
                std::mem::size_of::<CanAddr>() as u32,
            )
        };

        if bind_result == -1 {
            let e = io::Error::last_os_error();
            unsafe {
                libc::close(sock_fd);
            }
            return Err(TransportError::Connect(e));
        }

        Ok(Self { fd: sock_fd })
    }

    fn read_kernel(&self) -> io::Result<KernelFrame> {
        let mut frame = KernelFrame::default();
        let read_result = unsafe {
            let frame_ptr = &mut frame as *mut KernelFrame;
            libc::read(self.fd, frame_ptr as *mut libc::c_void, size_of::<KernelFrame>())
        };

        if read_result as usize != size_of::<KernelFrame>() {
            return Err(io::Error::last_os_error());
        }

        Ok(frame)
    }

    /// Blocks until a frame arrives or the receive timeout fires.
    pub fn read(&self) -> io::Result<Result<CanFrame, FrameError>> {
        Ok(self.read_kernel()?.to_frame())
    }

    pub fn write(&self, frame: &CanFrame) -> io::Result<()> {
        let kernel = KernelFrame::from_frame(frame);
        let write_result = unsafe {
            let frame_ptr = &kernel as *const KernelFrame;
            libc::write(self.fd, frame_ptr as *const libc::c_void, size_of::<KernelFrame>())
        };

        if write_result as usize != size_of::<KernelFrame>() {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Sets the read timeout on the socket
    pub fn set_read_timeout(&self, duration: Duration) -> io::Result<()> {
        util::set_socket_option(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &util::c_timeval_new(duration),
        )
    }

    /// Sets the write timeout on the socket
    pub fn set_write_timeout(&self, duration: Duration) -> io::Result<()> {
        util::set_socket_option(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            &util::c_timeval_new(duration),
        )
    }
}

impl Drop for RawCanSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for RawCanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// SocketCAN flavor of [`Transport`]. Error semantics mirror the TCP
/// variant: read timeouts retry, other failures drop the socket and the
/// reader reopens it after a backoff.
pub struct SocketCanTransport {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    interface: String,
    socket: Mutex<Option<Arc<RawCanSocket>>>,
    connected: AtomicBool,
    should_stop: AtomicBool,
    handler: FrameHandler,
}

impl SocketCanTransport {
    pub fn new(interface: &str, handler: FrameHandler) -> SocketCanTransport {
        SocketCanTransport {
            shared: Arc::new(Shared {
                interface: interface.to_string(),
                socket: Mutex::new(None),
                connected: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                handler,
            }),
            reader: Mutex::new(None),
        }
    }
}

impl Shared {
    fn reconnect(&self) -> Result<Arc<RawCanSocket>, TransportError> {
        let socket = RawCanSocket::open(&self.interface)?;
        socket.set_read_timeout(READ_TIMEOUT)?;
        socket.set_write_timeout(READ_TIMEOUT)?;
        let socket = Arc::new(socket);
        *self.socket.lock().unwrap() = Some(socket.clone());
        self.connected.store(true, Ordering::SeqCst);
        Ok(socket)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.socket.lock().unwrap() = None;
    }

    fn backoff(&self) {
        let slice = Duration::from_millis(100);
        let mut waited = Duration::from_millis(0);
        while waited < RECONNECT_BACKOFF && !self.should_stop.load(Ordering::SeqCst) {
            std::thread::sleep(slice);
            waited += slice;
        }
    }
}

fn reader_loop(shared: Arc<Shared>, initial: Arc<RawCanSocket>) {
    let mut socket = Some(initial);

    while !shared.should_stop.load(Ordering::SeqCst) {
        if !shared.connected.load(Ordering::SeqCst) {
            socket = None;
            shared.backoff();
            if shared.should_stop.load(Ordering::SeqCst) {
                break;
            }
            match shared.reconnect() {
                Ok(new_socket) => {
                    info!("reopened CAN interface {}", shared.interface);
                    socket = Some(new_socket);
                }
                Err(e) => debug!("reopening {} failed: {}", shared.interface, e),
            }
            continue;
        }

        let s = match socket.as_ref() {
            Some(s) => s.clone(),
            None => {
                shared.mark_disconnected();
                continue;
            }
        };

        match s.read() {
            Ok(Ok(frame)) => (shared.handler)(frame),
            Ok(Err(e)) => trace!("dropping inbound frame: {}", e),
            Err(ref e) if e.should_retry() => {}
            Err(e) => {
                debug!("read on {} failed: {}", shared.interface, e);
                shared.mark_disconnected();
            }
        }
    }
}

impl Transport for SocketCanTransport {
    fn connect(&self) -> Result<(), TransportError> {
        if self.shared.should_stop.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket = self.shared.reconnect()?;
        let mut reader = self.reader.lock().unwrap();
        if reader.is_none() {
            let shared = self.shared.clone();
            *reader = Some(
                std::thread::Builder::new()
                    .name("idscan-can-reader".into())
                    .spawn(move || reader_loop(shared, socket))
                    .expect("spawning the reader thread"),
            );
        }
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let mut guard = self.shared.socket.lock().unwrap();
        let socket = match guard.as_ref() {
            Some(s) => s.clone(),
            None => return Err(TransportError::NotConnected),
        };
        if let Err(e) = socket.write(frame) {
            *guard = None;
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
        self.shared.mark_disconnected();
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
