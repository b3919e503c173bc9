//! Length-prefixed bincode frames over TCP.
//!
//! A frame is a big-endian `u32` payload length followed by the bincode
//! encoding of one message. [`TcpServer`] accepts a single peer at a time
//! (a new connection replaces the previous one); [`TcpClient`] keeps
//! reconnecting with backoff until closed. Both hand every decoded message
//! to a handler closure on their reader thread.

#![allow(missing_docs)]

use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::copy::link::PeerLink;
use crate::core::errors::{MirrorError, Result};

/// Frames above this size are treated as a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub fn write_frame<W: Write, M: Serialize>(writer: &mut W, message: &M) -> Result<()> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(MirrorError::transport(
            "frame",
            format!("outgoing frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| MirrorError::transport("frame", "frame length overflows u32"))?;
    writer
        .write_all(&len.to_be_bytes())
        .and_then(|()| writer.write_all(&payload))
        .and_then(|()| writer.flush())
        .map_err(|e| MirrorError::transport("frame", e))
}

/// Read one frame; `Ok(None)` when the stream ended cleanly between frames.
pub fn read_frame<R: Read, M: DeserializeOwned>(reader: &mut R) -> Result<Option<M>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MirrorError::transport("frame", e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(MirrorError::transport(
            "frame",
            format!("incoming frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| MirrorError::transport("frame", e))?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// Decode frames until the stream closes or fails.
fn pump<In, H>(mut stream: TcpStream, peer: &str, handler: &H)
where
    In: DeserializeOwned,
    H: Fn(In),
{
    loop {
        match read_frame::<_, In>(&mut stream) {
            Ok(Some(message)) => handler(message),
            Ok(None) => {
                info!(peer, "peer closed connection");
                return;
            }
            Err(e) => {
                warn!(peer, error = %e, "dropping connection after read failure");
                return;
            }
        }
    }
}

fn send_on<M: Serialize>(slot: &Mutex<Option<TcpStream>>, peer: &str, message: &M) -> Result<()> {
    let mut guard = slot.lock();
    let Some(stream) = guard.as_mut() else {
        return Err(MirrorError::transport(peer, "not connected"));
    };
    if let Err(e) = write_frame(stream, message) {
        if let Some(stream) = guard.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        return Err(MirrorError::transport(peer, e));
    }
    Ok(())
}

fn spawn_named<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| MirrorError::Runtime {
            details: format!("failed to spawn {name}: {e}"),
        })
}

/// Listening endpoint sending `Out` messages to its current peer.
pub struct TcpServer<Out> {
    local_addr: SocketAddr,
    peer: Arc<Mutex<Option<TcpStream>>>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    _out: PhantomData<fn() -> Out>,
}

impl<Out: Serialize> TcpServer<Out> {
    /// Bind and start accepting. `on_connect` runs after each new peer is
    /// installed, so it may already `send`.
    pub fn bind<In, H, C>(addr: impl ToSocketAddrs, handler: H, on_connect: C) -> Result<Self>
    where
        In: DeserializeOwned + 'static,
        H: Fn(In) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr).map_err(|e| MirrorError::transport("bind", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MirrorError::transport("bind", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| MirrorError::transport("bind", e))?;

        let peer: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);

        let accept_peer = Arc::clone(&peer);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = spawn_named("cmir-accept", move || {
            while !accept_shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = install_peer::<In, H>(&accept_peer, stream, addr, &handler) {
                            warn!(peer = %addr, error = %e, "failed to set up connection");
                            continue;
                        }
                        on_connect();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        })?;

        info!(addr = %local_addr, "listening");
        Ok(Self {
            local_addr,
            peer,
            shutdown,
            accept_thread: Some(accept_thread),
            _out: PhantomData,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.peer.lock().is_some()
    }
}

fn install_peer<In, H>(
    slot: &Arc<Mutex<Option<TcpStream>>>,
    stream: TcpStream,
    addr: SocketAddr,
    handler: &Arc<H>,
) -> io::Result<()>
where
    In: DeserializeOwned + 'static,
    H: Fn(In) + Send + Sync + 'static,
{
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    if let Some(previous) = slot.lock().replace(stream) {
        debug!(peer = %addr, "new connection replaces previous peer");
        let _ = previous.shutdown(Shutdown::Both);
    }
    info!(peer = %addr, "peer connected");

    let handler = Arc::clone(handler);
    let slot = Arc::clone(slot);
    let name = addr.to_string();
    thread::Builder::new()
        .name("cmir-conn".to_string())
        .spawn(move || {
            pump::<In, H>(reader, &name, &*handler);
            let mut guard = slot.lock();
            let same_peer = guard
                .as_ref()
                .and_then(|current| current.peer_addr().ok())
                .is_none_or(|current| current == addr);
            if same_peer {
                guard.take();
            }
        })?;
    Ok(())
}

impl<Out: Serialize> PeerLink<Out> for TcpServer<Out> {
    fn send(&self, message: &Out) -> Result<()> {
        send_on(&self.peer, "peer", message)
    }
}

impl<Out> Drop for TcpServer<Out> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(stream) = self.peer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Connecting endpoint sending `Out` messages to the server.
pub struct TcpClient<Out> {
    peer_name: String,
    stream: Arc<Mutex<Option<TcpStream>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _out: PhantomData<fn() -> Out>,
}

impl<Out: Serialize> TcpClient<Out> {
    /// Start connecting to `addr` in the background.
    pub fn connect<In, H>(addr: impl Into<String>, handler: H) -> Result<Self>
    where
        In: DeserializeOwned + 'static,
        H: Fn(In) + Send + 'static,
    {
        let peer_name = addr.into();
        let stream: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let slot = Arc::clone(&stream);
        let stop = Arc::clone(&shutdown);
        let target = peer_name.clone();
        let thread = spawn_named("cmir-client", move || {
            let mut backoff = MIN_BACKOFF;
            while !stop.load(Ordering::Relaxed) {
                match TcpStream::connect(&target).and_then(|s| {
                    s.set_nodelay(true)?;
                    let reader = s.try_clone()?;
                    Ok((s, reader))
                }) {
                    Ok((writer, reader)) => {
                        info!(peer = %target, "connected");
                        backoff = MIN_BACKOFF;
                        *slot.lock() = Some(writer);
                        pump::<In, H>(reader, &target, &handler);
                        slot.lock().take();
                    }
                    Err(e) => {
                        debug!(peer = %target, error = %e, ?backoff, "connect failed");
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
                sleep_unless_stopped(&stop, backoff);
            }
        })?;

        Ok(Self {
            peer_name,
            stream,
            shutdown,
            thread: Some(thread),
            _out: PhantomData,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Stop reconnecting and drop the current connection.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) {
    let mut left = total;
    while !left.is_zero() && !stop.load(Ordering::Relaxed) {
        let step = left.min(ACCEPT_POLL);
        thread::sleep(step);
        left -= step;
    }
}

impl<Out: Serialize> PeerLink<Out> for TcpClient<Out> {
    fn send(&self, message: &Out) -> Result<()> {
        send_on(&self.stream, &self.peer_name, message)
    }
}

impl<Out> Drop for TcpClient<Out> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
