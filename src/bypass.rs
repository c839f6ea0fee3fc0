//! Kernel-bypass capture support (netmap, pcap, pf_ring, ...).
//!
//! These technologies share a few traits: they deliver complete frames
//!  including the layer-2 headers, they deliver *every* frame arriving on an
//!  interface, and one capture descriptor per interface is the natural
//!  granularity. A shared per-interface service therefore demultiplexes
//!  frames by `(destination address, destination port)` onto the readers
//!  registered with it, and hands everything else back to the host stack.
//!
//! The service runs as a strand: a single task owning both the capture
//!  descriptor and the endpoint registry, fed by a command channel. Registry
//!  mutations and packet dispatch are thereby serialised without a lock.

use crate::packet::decode_packet;
use crate::reader::{Reader, StreamState};
use crate::stream::{Stream, StreamCore};
use async_trait::async_trait;
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum BypassError {
    #[error("bypass type `{0}' is not implemented")]
    UnknownType(String),
    #[error("only IPv4 endpoints can be used with bypass, got {0}")]
    NonIpv4Endpoint(SocketAddr),
    #[error("endpoint {0} is already registered")]
    EndpointInUse(SocketAddrV4),
    #[error("endpoint {0} is not registered")]
    NotRegistered(SocketAddrV4),
    #[error("the bypass service has shut down")]
    ServiceGone,
    #[error("failed to open capture on interface `{interface}': {source}")]
    CaptureSetup {
        interface: String,
        source: anyhow::Error,
    },
}

bitflags! {
    /// Per-frame flags reported by a capture backend. Frames with either
    ///  flag set are not dispatched: host-ring frames were already seen by
    ///  the host stack, and a more-fragments frame is an incomplete slot.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct FrameFlags: u8 {
        const HOST_RING      = 0b0000_0001;
        const MORE_FRAGMENTS = 0b0000_0010;
    }
}

/// One raw Ethernet frame delivered by a capture backend.
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub flags: FrameFlags,
}

/// Integration seam for a concrete capture technology. The service owns the
///  source for its whole life and drops it (closing the descriptor) when the
///  last reader unregisters.
#[async_trait]
pub trait CaptureSource: Send + 'static {
    /// Wait for the next sweep of frames. Must be cancel-safe: the service
    ///  concurrently waits for registry commands.
    async fn next_batch(&mut self) -> io::Result<Vec<CapturedFrame>>;

    /// Hand a frame that was not consumed back to the host network stack.
    fn forward_to_host(&mut self, frame: CapturedFrame);
}

type CaptureFactory = Box<dyn Fn(&str) -> anyhow::Result<Box<dyn CaptureSource>> + Send + Sync>;

struct BypassType {
    factory: CaptureFactory,
    /// Weak per-interface references: the readers hold the strong ones.
    services: FxHashMap<String, Weak<BypassService>>,
}

fn registry() -> &'static Mutex<FxHashMap<String, BypassType>> {
    static REGISTRY: OnceLock<Mutex<FxHashMap<String, BypassType>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Make a capture technology available under `name`. No backend is built in
///  (which ones exist depends on the platform and the linked libraries), so
///  a process registers the ones it supports before creating bypass readers.
pub fn register_bypass_type(
    name: impl Into<String>,
    factory: impl Fn(&str) -> anyhow::Result<Box<dyn CaptureSource>> + Send + Sync + 'static,
) {
    let name = name.into();
    let mut registry = registry().lock().unwrap();
    if registry.contains_key(&name) {
        debug!("bypass type `{}' registered twice - keeping the first factory", name);
        return;
    }
    registry.insert(
        name,
        BypassType {
            factory: Box::new(factory),
            services: FxHashMap::default(),
        },
    );
}

/// The registered bypass type names, sorted.
pub fn bypass_types() -> Vec<String> {
    let mut names: Vec<String> = registry().lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}

enum Command {
    Register {
        endpoint: SocketAddrV4,
        reader: Arc<BypassReader>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Unregister {
        endpoint: SocketAddrV4,
        reply: oneshot::Sender<Result<(), BypassError>>,
    },
}

/// Shared handle to a per-`(type, interface)` capture service. Every
///  subscribed reader holds a strong reference; when the last one drops, the
///  command channel closes, the strand exits and the capture descriptor is
///  released.
pub struct BypassService {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl BypassService {
    /// Fetch or create the shared service for `(bypass_type, interface)`.
    pub fn get_instance(bypass_type: &str, interface: &str) -> Result<Arc<BypassService>, BypassError> {
        let mut registry = registry().lock().unwrap();
        let service_type = registry
            .get_mut(bypass_type)
            .ok_or_else(|| BypassError::UnknownType(bypass_type.to_string()))?;

        if let Some(existing) = service_type.services.get(interface).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let source = (service_type.factory)(interface).map_err(|source| BypassError::CaptureSetup {
            interface: interface.to_string(),
            source,
        })?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_service(source, cmd_rx));

        let service = Arc::new(BypassService { cmd_tx });
        service_type.services.insert(interface.to_string(), Arc::downgrade(&service));
        debug!("started bypass service for interface `{}'", interface);
        Ok(service)
    }

    fn register(&self, endpoint: SocketAddrV4, reader: Arc<BypassReader>) -> oneshot::Receiver<anyhow::Result<()>> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(command)) = self.cmd_tx.send(Command::Register {
            endpoint,
            reader,
            reply,
        }) {
            if let Command::Register { reply, .. } = command {
                let _ = reply.send(Err(BypassError::ServiceGone.into()));
            }
        }
        rx
    }

    async fn unregister(&self, endpoint: SocketAddrV4) -> Result<(), BypassError> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Unregister { endpoint, reply }).is_err() {
            return Err(BypassError::ServiceGone);
        }
        rx.await.map_err(|_| BypassError::ServiceGone)?
    }
}

/// The strand: sole owner of the capture source and the endpoint registry.
async fn run_service(mut source: Box<dyn CaptureSource>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut readers: FxHashMap<(Ipv4Addr, u16), Arc<BypassReader>> = FxHashMap::default();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Register { endpoint, reader, reply }) => {
                    let result = match readers.entry((*endpoint.ip(), endpoint.port())) {
                        Entry::Occupied(_) => Err(BypassError::EndpointInUse(endpoint).into()),
                        Entry::Vacant(entry) => {
                            debug!("bypass endpoint {} registered", endpoint);
                            entry.insert(reader);
                            Ok(())
                        }
                    };
                    let _ = reply.send(result);
                }
                Some(Command::Unregister { endpoint, reply }) => {
                    let result = readers
                        .remove(&(*endpoint.ip(), endpoint.port()))
                        .map(|_| debug!("bypass endpoint {} unregistered", endpoint))
                        .ok_or(BypassError::NotRegistered(endpoint));
                    let _ = reply.send(result);
                }
                None => break, // the last strong holder released the service
            },
            batch = source.next_batch() => match batch {
                Ok(frames) => {
                    for frame in frames {
                        let eligible = !frame.flags.intersects(FrameFlags::HOST_RING | FrameFlags::MORE_FRAGMENTS);
                        let consumed = eligible && dispatch_frame(&readers, &frame.data);
                        if !consumed {
                            source.forward_to_host(frame);
                        }
                    }
                }
                Err(e) => warn!("capture poll failed: {}", e),
            }
        }
    }
    debug!("bypass service winding up, closing the capture descriptor");
    // `source` is dropped here, before the task itself finishes
}

const ETH_HEADER_LEN: usize = 14;
const FRAME_HEADER_LEN: usize = ETH_HEADER_LEN + 20 + 8;

/// Match a raw frame to a registered reader and hand over the UDP payload.
///
/// Accepts only unfragmented Ethernet II + IPv4 + UDP frames without IP
///  options (with options the UDP header would be at an unknown offset). A
///  specific `(address, port)` registration wins over a wildcard
///  `(0.0.0.0, port)` one. Returns whether the frame was consumed.
fn dispatch_frame(readers: &FxHashMap<(Ipv4Addr, u16), Arc<BypassReader>>, data: &[u8]) -> bool {
    if data.len() < FRAME_HEADER_LEN {
        return false;
    }
    if u16::from_be_bytes([data[12], data[13]]) != 0x0800 {
        return false;
    }
    if data[ETH_HEADER_LEN] != 0x45 {
        return false;
    }
    if data[ETH_HEADER_LEN + 9] != 17 {
        return false;
    }
    // fragment offset and the more-fragments bit must both be zero
    if u16::from_be_bytes([data[ETH_HEADER_LEN + 6], data[ETH_HEADER_LEN + 7]]) & 0x3fff != 0 {
        return false;
    }

    let daddr = Ipv4Addr::new(data[30], data[31], data[32], data[33]);
    let dport = u16::from_be_bytes([data[36], data[37]]);

    let reader = readers
        .get(&(daddr, dport))
        .or_else(|| readers.get(&(Ipv4Addr::UNSPECIFIED, dport)));
    match reader {
        Some(reader) => {
            trace!("dispatching frame for {}:{}", daddr, dport);
            reader.process_packet(&data[FRAME_HEADER_LEN..]);
            true
        }
        None => false,
    }
}

/// Reader fed by a [`BypassService`] instead of its own socket.
pub struct BypassReader {
    weak_self: Weak<BypassReader>,
    core: Weak<StreamCore>,
    endpoint: SocketAddrV4,
    /// Strong service reference for the registered lifetime; taken on detach
    ///  so the service can wind down once its last reader is gone.
    service: Mutex<Option<Arc<BypassService>>>,
    done: AtomicBool,
    joined: Notify,
}

impl BypassReader {
    /// Create a reader listening for `endpoint` on the capture service of
    ///  `(bypass_type, interface)`. Registration happens when the reader is
    ///  attached to the stream.
    pub fn new(
        stream: &Stream,
        bypass_type: &str,
        interface: &str,
        endpoint: SocketAddr,
    ) -> Result<Arc<BypassReader>, BypassError> {
        let SocketAddr::V4(endpoint) = endpoint else {
            return Err(BypassError::NonIpv4Endpoint(endpoint));
        };
        let service = BypassService::get_instance(bypass_type, interface)?;
        Ok(Arc::new_cyclic(|weak_self| BypassReader {
            weak_self: weak_self.clone(),
            core: Arc::downgrade(stream.core()),
            endpoint,
            service: Mutex::new(Some(service)),
            done: AtomicBool::new(false),
            joined: Notify::new(),
        }))
    }

    /// Handle one SPEAD packet (the UDP payload, L2/L3 headers stripped).
    ///  Called only from the service strand.
    fn process_packet(&self, data: &[u8]) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match decode_packet(data) {
            Ok((size, header)) if size == data.len() => {
                let mut shared = core.lock();
                let assembler = &mut shared.assembler;
                if assembler.is_stopped() {
                    trace!("bypass reader: dropping packet received after stream stop");
                    return;
                }
                if assembler.is_paused() {
                    // there is no pausing the wire: a bypass reader sheds load
                    debug!("bypass reader: dropping packet while the stream is paused");
                    return;
                }
                let payload = &data[header.payload_start..][..header.payload_length as usize];
                assembler.add_packet(&header, payload);
                if assembler.is_stopped() {
                    debug!("bypass reader: end of stream detected");
                    // the stop arrived on the capture path itself, so nobody
                    //  else will unregister this reader
                    self.detach();
                }
            }
            Ok((size, _)) => {
                info!("discarding packet due to size mismatch ({} != {})", size, data.len());
            }
            Err(e) => {
                debug!("discarding undecodable packet: {}", e);
            }
        }
    }

    /// Unregister from the service and release the strong reference. Called
    ///  both on an application stop and from [`process_packet`] when the
    ///  stream-stop arrived on the capture path itself. Safe either way: the
    ///  unregistration runs on a separate task and goes through the command
    ///  channel, so it can never re-enter the strand that may currently be
    ///  calling into this reader, and it holds no lock while it waits.
    ///  Idempotent.
    fn detach(&self) {
        let Some(service) = self.service.lock().unwrap().take() else {
            return;
        };
        let endpoint = self.endpoint;
        let me = self.weak_self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.unregister(endpoint).await {
                warn!("unregistering bypass endpoint {} failed: {}", endpoint, e);
            }
            drop(service);
            if let Some(me) = me.upgrade() {
                me.done.store(true, Ordering::Release);
                me.joined.notify_one();
            }
        });
    }
}

#[async_trait]
impl Reader for BypassReader {
    fn start(&self) -> Option<oneshot::Receiver<anyhow::Result<()>>> {
        let me = self.weak_self.upgrade().expect("start is called on a live reader");
        let service = self.service.lock().unwrap().clone();
        match service {
            Some(service) => Some(service.register(self.endpoint, me)),
            None => None,
        }
    }

    fn state_change(&self, state: StreamState) {
        if state.stopped {
            self.detach();
        }
    }

    async fn join(&self) {
        loop {
            if self.done.load(Ordering::Acquire) {
                return;
            }
            self.joined.notified().await;
        }
    }
}
