// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport for sACN multicast send/receive.
//!
//! One [`SacnSocket`] wraps one UDP socket on one IP family, optionally bound
//! to a named interface. Receivers bind the sACN port with address and port
//! reuse so multiple receiver processes coexist on a host; senders bind an
//! ephemeral port and pin their outbound multicast interface.
//!
//! Receiving spawns a dedicated thread per socket that hands complete
//! datagrams to a callback; the thread polls a shutdown flag on a short read
//! timeout, so `close()` returns promptly without extra wakeup machinery.

pub mod multicast;

pub use multicast::{IpFamily, IpMode};

use crate::error::{Error, Result};
use crate::protocol::constants::SACN_PORT;
use multicast::ResolvedInterface;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll interval for the shutdown flag in the receive loop.
const RECV_POLL: Duration = Duration::from_millis(500);

/// Called with each received datagram: payload, source address, family.
pub type DatagramHandler = Arc<dyn Fn(&[u8], SocketAddr, IpFamily) + Send + Sync>;
/// Called once when a receive loop ends; `Some` carries the fatal error.
pub type ClosedHandler = Arc<dyn Fn(Option<io::Error>) + Send + Sync>;

/// A single-family UDP socket for sACN traffic.
pub struct SacnSocket {
    socket: Arc<UdpSocket>,
    family: IpFamily,
    /// Interface this socket is pinned to, if any.
    interface: Option<ResolvedInterface>,
    joined: Vec<IpAddr>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SacnSocket {
    /// Bind a receive socket on the sACN port with address + port reuse.
    pub fn bind_receiver(family: IpFamily, interface: Option<&ResolvedInterface>) -> Result<Self> {
        let socket = new_socket(family)?;
        socket
            .set_reuse_address(true)
            .map_err(Error::PortReuse)?;
        #[cfg(unix)]
        set_reuse_port(&socket).map_err(Error::PortReuse)?;

        let bind_addr = wildcard_addr(family, SACN_PORT);
        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::Bind(bind_addr.to_string(), e))?;
        log::debug!(
            "[UDP] receiver bound {} iface={}",
            bind_addr,
            interface.map_or("any", |i| i.name.as_str())
        );

        Self::from_parts(socket, family, interface.cloned())
    }

    /// Bind a send socket on an ephemeral port, pinned to `interface` for
    /// outbound multicast when one is given.
    pub fn bind_sender(family: IpFamily, interface: Option<&ResolvedInterface>) -> Result<Self> {
        let socket = new_socket(family)?;
        let bind_addr = wildcard_addr(family, 0);
        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::Bind(bind_addr.to_string(), e))?;

        match family {
            IpFamily::V4 => {
                if let Some(v4) = interface.and_then(|i| i.v4) {
                    socket
                        .set_multicast_if_v4(&v4)
                        .map_err(|e| Error::MulticastInterface(v4.to_string(), e))?;
                }
                socket
                    .set_multicast_ttl_v4(u32::from(MULTICAST_TTL))
                    .map_err(|e| Error::MulticastInterface("ttl".into(), e))?;
                socket
                    .set_multicast_loop_v4(true)
                    .map_err(|e| Error::MulticastInterface("loop".into(), e))?;
            }
            IpFamily::V6 => {
                let index = interface.map_or(0, |i| i.index);
                socket
                    .set_multicast_if_v6(index)
                    .map_err(|e| Error::MulticastInterface(format!("index {}", index), e))?;
                socket
                    .set_multicast_loop_v6(true)
                    .map_err(|e| Error::MulticastInterface("loop".into(), e))?;
            }
        }
        log::debug!(
            "[UDP] sender bound {} family={:?} iface={}",
            bind_addr,
            family,
            interface.map_or("default", |i| i.name.as_str())
        );

        Self::from_parts(socket, family, interface.cloned())
    }

    fn from_parts(
        socket: Socket,
        family: IpFamily,
        interface: Option<ResolvedInterface>,
    ) -> Result<Self> {
        socket
            .set_read_timeout(Some(RECV_POLL))
            .map_err(Error::Receive)?;
        Ok(Self {
            socket: Arc::new(socket.into()),
            family,
            interface,
            joined: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// The name of the interface this socket is pinned to, if any.
    pub fn interface_name(&self) -> Option<&str> {
        self.interface.as_ref().map(|i| i.name.as_str())
    }

    /// Join a multicast group on this socket's interface.
    pub fn join_multicast(&mut self, group: IpAddr) -> Result<()> {
        let result = match (group, self.family) {
            (IpAddr::V4(group), IpFamily::V4) => {
                let iface = self
                    .interface
                    .as_ref()
                    .and_then(|i| i.v4)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                self.socket.join_multicast_v4(&group, &iface)
            }
            (IpAddr::V6(group), IpFamily::V6) => {
                let index = self.interface.as_ref().map_or(0, |i| i.index);
                self.socket.join_multicast_v6(&group, index)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "group family does not match socket family",
            )),
        };
        match result {
            Ok(()) => {
                log::debug!(
                    "[UDP] joined {} iface={}",
                    group,
                    self.interface_name().unwrap_or("any")
                );
                self.joined.push(group);
                Ok(())
            }
            Err(e) => Err(Error::MulticastJoin(group.to_string(), e)),
        }
    }

    /// Leave a multicast group previously joined.
    pub fn leave_multicast(&mut self, group: IpAddr) -> Result<()> {
        let result = match (group, self.family) {
            (IpAddr::V4(group), IpFamily::V4) => {
                let iface = self
                    .interface
                    .as_ref()
                    .and_then(|i| i.v4)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                self.socket.leave_multicast_v4(&group, &iface)
            }
            (IpAddr::V6(group), IpFamily::V6) => {
                let index = self.interface.as_ref().map_or(0, |i| i.index);
                self.socket.leave_multicast_v6(&group, index)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "group family does not match socket family",
            )),
        };
        self.joined.retain(|g| *g != group);
        result.map_err(|e| Error::MulticastLeave(group.to_string(), e))
    }

    /// Send one datagram.
    pub fn send(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let sent = self.socket.send_to(data, dest)?;
        log::trace!("[UDP] send {} bytes -> {}", sent, dest);
        Ok(sent)
    }

    /// Spawn the receive thread. Datagrams go to `on_datagram`; when the loop
    /// exits, `on_closed` fires once with the fatal error if there was one.
    pub fn begin_receiving(
        &mut self,
        on_datagram: DatagramHandler,
        on_closed: ClosedHandler,
    ) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::AlreadyStarted);
        }
        self.running.store(true, Ordering::SeqCst);

        let socket = Arc::clone(&self.socket);
        let running = Arc::clone(&self.running);
        let family = self.family;

        let handle = std::thread::Builder::new()
            .name("sacn-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 2048];
                let error = loop {
                    if !running.load(Ordering::SeqCst) {
                        break None;
                    }
                    match socket.recv_from(&mut buf) {
                        Ok((len, src)) => on_datagram(&buf[..len], src, family),
                        Err(e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            log::debug!("[UDP] recv failed: {}", e);
                            break Some(e);
                        }
                    }
                };
                if running.swap(false, Ordering::SeqCst) || error.is_some() {
                    on_closed(error);
                }
            })
            .map_err(Error::Receive)?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the receive thread (if any) and leave all joined groups.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        for group in std::mem::take(&mut self.joined) {
            // Best effort; the OS drops memberships with the socket anyway.
            if let Err(e) = self.leave_multicast(group) {
                log::debug!("[UDP] leave on close failed: {}", e);
            }
        }
    }
}

impl Drop for SacnSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn new_socket(family: IpFamily) -> Result<Socket> {
    let domain = match family {
        IpFamily::V4 => Domain::IPV4,
        IpFamily::V6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Bind("socket".into(), e))?;
    if family == IpFamily::V6 {
        socket
            .set_only_v6(true)
            .map_err(|e| Error::Bind("v6only".into(), e))?;
    }
    Ok(socket)
}

fn wildcard_addr(family: IpFamily, port: u16) -> SocketAddr {
    match family {
        IpFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpFamily::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// E1.31 recommends the data TTL stay LAN-local.
const MULTICAST_TTL: u8 = 4;

/// Enable `SO_REUSEPORT` so several receiver processes can bind the sACN
/// port. `SO_REUSEADDR` alone is not enough on Linux for concurrent binds.
#[cfg(unix)]
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd, standard socket option, and
    // correctly sized optval pointer.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            std::ptr::addr_of!(optval).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicast::{group_addr, universe_group_v4};

    #[test]
    fn test_receiver_binds_sacn_port() {
        let socket = SacnSocket::bind_receiver(IpFamily::V4, None);
        assert!(socket.is_ok(), "bind should succeed: {:?}", socket.err());
    }

    #[test]
    fn test_two_receivers_share_port() {
        let a = SacnSocket::bind_receiver(IpFamily::V4, None).expect("first bind");
        let b = SacnSocket::bind_receiver(IpFamily::V4, None);
        assert!(b.is_ok(), "port reuse should allow a second bind");
        drop(a);
    }

    #[test]
    fn test_join_and_leave_group() {
        let mut socket = SacnSocket::bind_receiver(IpFamily::V4, None).expect("bind");
        let group = IpAddr::V4(universe_group_v4(1));
        socket.join_multicast(group).expect("join");
        socket.leave_multicast(group).expect("leave");
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let mut socket = SacnSocket::bind_receiver(IpFamily::V4, None).expect("bind");
        let v6_group = IpAddr::V6(multicast::universe_group_v6(1));
        assert!(matches!(
            socket.join_multicast(v6_group),
            Err(Error::MulticastJoin(_, _))
        ));
    }

    #[test]
    fn test_sender_can_send_to_group() {
        let sender = SacnSocket::bind_sender(IpFamily::V4, None).expect("bind");
        let sent = sender.send(b"probe", group_addr(1, IpFamily::V4));
        assert!(sent.is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut socket = SacnSocket::bind_receiver(IpFamily::V4, None).expect("bind");
        socket.close();
        socket.close();
    }
}
