use crate::config::UdpConfig;
use crate::packet::decode_packet;
use crate::reader::{Reader, StreamState};
use crate::stream::{Stream, StreamAssembler, StreamCore};
use anyhow::bail;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, span, warn, Level};
use uuid::Uuid;

/// Asynchronous stream reader that receives packets over UDP.
///
/// Each I/O turn receives up to `mmsg_count` datagrams (where the OS provides
///  a vectored multi-message receive; one otherwise), then processes them in
///  order under a single acquisition of the stream mutex. Every receive
///  buffer is one byte larger than the maximum accepted packet size so that
///  truncation by the kernel is detectable.
pub struct UdpReader {
    inner: Arc<UdpReaderInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct UdpReaderInner {
    core: Weak<StreamCore>,
    socket: UdpSocket,
    max_size: usize,
    batch: usize,
    wake: Notify,
}

impl UdpReader {
    /// Create a reader listening on `endpoint`.
    ///
    /// If `endpoint` is a multicast group the socket gets `SO_REUSEADDR` (so
    ///  several sockets can subscribe to the group) and joins the group on
    ///  the configured interface, or on whatever the stack picks.
    ///
    /// Fatal socket errors (address in use, resource exhaustion) propagate to
    ///  the caller; a refused receive-buffer size only logs a warning.
    pub fn new(stream: &Stream, endpoint: SocketAddr, config: UdpConfig) -> anyhow::Result<Arc<UdpReader>> {
        config.validate()?;
        let socket = make_socket(endpoint, &config)?;
        let socket = UdpSocket::from_std(socket)?;
        Ok(Arc::new(UdpReader {
            inner: Arc::new(UdpReaderInner {
                core: Arc::downgrade(stream.core()),
                socket,
                max_size: config.max_size,
                batch: batch_size(&config),
                wake: Notify::new(),
            }),
            handle: Mutex::new(None),
        }))
    }

    /// The locally bound address, mainly useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }
}

#[async_trait]
impl Reader for UdpReader {
    fn start(&self) -> Option<oneshot::Receiver<anyhow::Result<()>>> {
        let inner = self.inner.clone();
        *self.handle.lock().unwrap() = Some(tokio::spawn(run(inner)));
        None
    }

    fn state_change(&self, _state: StreamState) {
        self.inner.wake.notify_one();
    }

    async fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("UDP reader task failed: {}", e);
            }
        }
    }
}

fn make_socket(endpoint: SocketAddr, config: &UdpConfig) -> anyhow::Result<std::net::UdpSocket> {
    let domain = if endpoint.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if endpoint.ip().is_multicast() {
        // several sockets may subscribe to the same group
        socket.set_reuse_address(true)?;
        match endpoint.ip() {
            IpAddr::V4(group) => {
                let interface = config.multicast_interface_v4.unwrap_or(Ipv4Addr::UNSPECIFIED);
                socket.join_multicast_v4(&group, &interface)?;
            }
            IpAddr::V6(group) => {
                socket.join_multicast_v6(&group, config.multicast_interface_v6.unwrap_or(0))?;
            }
        }
    }
    else if config.multicast_interface_v4.is_some() || config.multicast_interface_v6.is_some() {
        bail!("a multicast interface was configured but {} is not a multicast address", endpoint);
    }

    if config.buffer_size != 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.buffer_size) {
            warn!(
                "request for receive buffer size {} failed ({}): see the OS documentation on raising the limit",
                config.buffer_size, e
            );
        }
        else {
            // Linux silently clips to the maximum allowed size
            let actual = socket.recv_buffer_size()?;
            if actual < config.buffer_size {
                warn!(
                    "requested receive buffer size {} but only got {}: see the OS documentation on raising the limit",
                    config.buffer_size, actual
                );
            }
        }
    }

    socket.bind(&endpoint.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(target_os = "linux")]
fn batch_size(config: &UdpConfig) -> usize {
    config.mmsg_count
}

#[cfg(not(target_os = "linux"))]
fn batch_size(_config: &UdpConfig) -> usize {
    1
}

enum Next {
    Stopped,
    Paused,
    Receive,
}

async fn run(inner: Arc<UdpReaderInner>) {
    // one extra byte per buffer so oversized datagrams are detectable
    let mut buffers: Vec<Vec<u8>> = (0..inner.batch).map(|_| vec![0u8; inner.max_size + 1]).collect();
    let mut lengths = vec![0usize; inner.batch];
    // window of received-but-unprocessed packets, carried across a pause
    let mut resume_first = 0usize;
    let mut resume_last = 0usize;

    loop {
        let Some(core) = inner.core.upgrade() else {
            return;
        };
        let next = {
            let mut shared = core.lock();
            let assembler = &mut shared.assembler;

            if resume_first < resume_last {
                let correlation_id = Uuid::new_v4();
                let turn = span!(Level::TRACE, "udp_receive_turn", ?correlation_id);
                let _entered = turn.enter();

                while resume_first < resume_last {
                    if assembler.is_stopped() {
                        info!("discarding packets received after stream stopped");
                        resume_first = resume_last;
                        break;
                    }
                    if assembler.is_paused() {
                        break;
                    }
                    process_one(&buffers[resume_first], lengths[resume_first], inner.max_size, assembler);
                    resume_first += 1;
                }
            }

            if assembler.is_stopped() {
                Next::Stopped
            }
            else if assembler.is_paused() {
                Next::Paused
            }
            else {
                Next::Receive
            }
        };
        drop(core);

        match next {
            Next::Stopped => {
                debug!("UDP reader winding up");
                return;
            }
            Next::Paused => {
                inner.wake.notified().await;
                continue;
            }
            Next::Receive => {}
        }

        resume_first = 0;
        resume_last = 0;
        tokio::select! {
            _ = inner.wake.notified() => {
                // state changed while waiting: abort the pending receive and re-check
            }
            received = receive_batch(&inner.socket, &mut buffers, &mut lengths) => match received {
                Ok(count) => resume_last = count,
                Err(e) => warn!("UDP receive failed: {}", e),
            }
        }
    }
}

fn process_one(buffer: &[u8], length: usize, max_size: usize, assembler: &mut StreamAssembler) {
    if length > max_size {
        info!("dropped packet due to truncation");
        return;
    }
    if length == 0 {
        return;
    }
    let data = &buffer[..length];
    match decode_packet(data) {
        Ok((size, header)) if size == length => {
            let payload = &data[header.payload_start..][..header.payload_length as usize];
            assembler.add_packet(&header, payload);
            if assembler.is_stopped() {
                debug!("UDP reader: end of stream detected");
            }
        }
        Ok((size, _)) => {
            info!("discarding packet due to size mismatch ({} != {})", size, length);
        }
        Err(e) => {
            debug!("discarding undecodable packet: {}", e);
        }
    }
}

/// Drain up to a batch of datagrams with one `recvmmsg` call once the socket
///  is readable.
#[cfg(target_os = "linux")]
async fn receive_batch(
    socket: &UdpSocket,
    buffers: &mut [Vec<u8>],
    lengths: &mut [usize],
) -> io::Result<usize> {
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;

    loop {
        socket.readable().await?;
        let result = socket.try_io(Interest::READABLE, || {
            let mut iovecs: Vec<libc::iovec> = buffers
                .iter_mut()
                .map(|buffer| libc::iovec {
                    iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
                    iov_len: buffer.len(),
                })
                .collect();
            let mut msgvec: Vec<libc::mmsghdr> = iovecs
                .iter_mut()
                .map(|iovec| {
                    let mut msg: libc::mmsghdr = unsafe { std::mem::zeroed() };
                    msg.msg_hdr.msg_iov = iovec as *mut libc::iovec;
                    msg.msg_hdr.msg_iovlen = 1;
                    msg
                })
                .collect();

            let received = unsafe {
                libc::recvmmsg(
                    socket.as_raw_fd(),
                    msgvec.as_mut_ptr(),
                    msgvec.len() as u32,
                    libc::MSG_DONTWAIT,
                    std::ptr::null_mut(),
                )
            };
            if received < 0 {
                return Err(io::Error::last_os_error());
            }
            for (length, msg) in lengths.iter_mut().zip(msgvec.iter().take(received as usize)) {
                *length = msg.msg_len as usize;
            }
            Ok(received as usize)
        });
        match result {
            Ok(count) => return Ok(count),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn receive_batch(
    socket: &UdpSocket,
    buffers: &mut [Vec<u8>],
    lengths: &mut [usize],
) -> io::Result<usize> {
    let (length, _from) = socket.recv_from(&mut buffers[0]).await?;
    lengths[0] = length;
    Ok(1)
}
