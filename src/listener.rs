use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::str::FromStr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use crate::constants::{
    ADVERTISED_UDP_SIZE_EXTRA, ADVERTISED_UDP_SIZE_PRIMARY, DNS_PORT, STUB_LISTENER_ADDR,
    TCP_FASTOPEN_QUEUE,
};
use crate::error::{Result, StubError};
use crate::query::InFlightTable;

/// Which listener a request arrived on. The primary listener is the
/// loopback stub; extra listeners are indexed into the configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenerScope {
    Primary,
    Extra(usize),
}

impl ListenerScope {
    pub fn is_primary(self) -> bool {
        matches!(self, ListenerScope::Primary)
    }

    /// UDP payload size we advertise in reply OPT records.
    pub fn advertised_udp_size(self) -> u16 {
        match self {
            ListenerScope::Primary => ADVERTISED_UDP_SIZE_PRIMARY,
            ListenerScope::Extra(_) => ADVERTISED_UDP_SIZE_EXTRA,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenMode {
    Udp,
    Tcp,
    Both,
}

impl ListenMode {
    pub fn wants_udp(self) -> bool {
        matches!(self, ListenMode::Udp | ListenMode::Both)
    }

    pub fn wants_tcp(self) -> bool {
        matches!(self, ListenMode::Tcp | ListenMode::Both)
    }
}

/// An additional listener endpoint. Equality is by (mode, family,
/// address, port), which also makes duplicates in the configuration
/// detectable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraListener {
    pub mode: ListenMode,
    pub address: IpAddr,
    pub port: u16,
}

impl ExtraListener {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl FromStr for ExtraListener {
    type Err = StubError;

    /// Accepts `[udp:|tcp:]address[:port]`, with IPv6 addresses in
    /// brackets when a port is given, e.g. `udp:[2001:db8::1]:5353`.
    /// Wildcard addresses are rejected: binding to a concrete address
    /// is what fixes the reply source address and interface.
    fn from_str(spec: &str) -> Result<Self> {
        let bad = || StubError::InvalidListenerSpec(spec.to_string());

        let (mode, rest) = if let Some(rest) = spec.strip_prefix("udp:") {
            (ListenMode::Udp, rest)
        } else if let Some(rest) = spec.strip_prefix("tcp:") {
            (ListenMode::Tcp, rest)
        } else {
            (ListenMode::Both, spec)
        };

        let (address, port) = if let Ok(address) = IpAddr::from_str(rest) {
            (address, DNS_PORT)
        } else {
            let addr = SocketAddr::from_str(rest).map_err(|_| bad())?;
            (addr.ip(), addr.port())
        };
        if address.is_unspecified() {
            return Err(bad());
        }
        Ok(Self {
            mode,
            address,
            port,
        })
    }
}

/// The sockets of one endpoint plus its own in-flight table.
pub struct ListenerSockets {
    pub scope: ListenerScope,
    pub udp: Option<Arc<UdpSocket>>,
    pub tcp: Option<TcpListener>,
    pub inflight: Arc<InFlightTable>,
}

/// Bind the primary stub listener on 127.0.0.53:53. An address conflict
/// disables the stub with a warning instead of failing the process.
pub fn bind_primary() -> Result<Option<ListenerSockets>> {
    let addr = STUB_LISTENER_ADDR;

    let udp = match udp_socket(addr, true) {
        Ok(socket) => socket,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            warn!(%addr, "stub listener address in use, disabling stub listener");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let tcp = match tcp_listener(addr, true) {
        Ok(listener) => listener,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            warn!(%addr, "stub listener address in use, disabling stub listener");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    info!(%addr, "listening on primary stub endpoint (udp+tcp)");
    Ok(Some(ListenerSockets {
        scope: ListenerScope::Primary,
        udp: Some(Arc::new(udp)),
        tcp: Some(tcp),
        inflight: Arc::new(InFlightTable::default()),
    }))
}

/// Bind one extra endpoint. Failure disables only this endpoint.
pub fn bind_extra(index: usize, extra: &ExtraListener) -> Option<ListenerSockets> {
    let addr = extra.socket_addr();

    let udp = if extra.mode.wants_udp() {
        match udp_socket(addr, false) {
            Ok(socket) => Some(Arc::new(socket)),
            Err(err) => {
                warn!(%addr, "failed to bind extra udp listener, disabling it: {err}");
                return None;
            }
        }
    } else {
        None
    };
    let tcp = if extra.mode.wants_tcp() {
        match tcp_listener(addr, false) {
            Ok(listener) => Some(listener),
            Err(err) => {
                warn!(%addr, "failed to bind extra tcp listener, disabling it: {err}");
                return None;
            }
        }
    } else {
        None
    };

    info!(%addr, mode = ?extra.mode, "listening on extra stub endpoint");
    Some(ListenerSockets {
        scope: ListenerScope::Extra(index),
        udp,
        tcp,
        inflight: Arc::new(InFlightTable::default()),
    })
}

fn udp_socket(addr: SocketAddr, primary: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if primary {
        // Replies must never leak off-host.
        socket.set_ttl(1)?;
    } else {
        // The configured address may not exist yet at bind time.
        set_freebind(&socket, addr)?;
        disable_pmtud(&socket, addr)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn tcp_listener(addr: SocketAddr, primary: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    setsockopt(
        &socket,
        libc::IPPROTO_TCP,
        libc::TCP_FASTOPEN,
        TCP_FASTOPEN_QUEUE,
    )?;

    if primary {
        socket.set_ttl(1)?;
    } else {
        set_freebind(&socket, addr)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    TcpListener::from_std(socket.into())
}

/// Options socket2 does not cover go through setsockopt directly.
fn setsockopt(socket: &Socket, level: libc::c_int, option: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            std::ptr::from_ref(&value).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_freebind(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(_) => setsockopt(socket, libc::IPPROTO_IP, libc::IP_FREEBIND, 1),
        SocketAddr::V6(_) => setsockopt(socket, libc::IPPROTO_IPV6, libc::IPV6_FREEBIND, 1),
    }
}

fn disable_pmtud(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(_) => setsockopt(
            socket,
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_DONT,
        ),
        SocketAddr::V6(_) => setsockopt(
            socket,
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IPV6_PMTUDISC_DONT,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_address_defaults() {
        let extra: ExtraListener = "192.0.2.1".parse().unwrap();
        assert_eq!(extra.mode, ListenMode::Both);
        assert_eq!(extra.port, DNS_PORT);
    }

    #[test]
    fn parse_mode_and_port() {
        let extra: ExtraListener = "udp:192.0.2.1:5353".parse().unwrap();
        assert_eq!(extra.mode, ListenMode::Udp);
        assert_eq!(extra.port, 5353);

        let extra: ExtraListener = "tcp:[2001:db8::1]:5300".parse().unwrap();
        assert_eq!(extra.mode, ListenMode::Tcp);
        assert!(extra.address.is_ipv6());
        assert_eq!(extra.port, 5300);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("pigeon:carrier".parse::<ExtraListener>().is_err());
        assert!("udp:".parse::<ExtraListener>().is_err());
    }

    #[test]
    fn parse_rejects_wildcard_addresses() {
        assert!("0.0.0.0".parse::<ExtraListener>().is_err());
        assert!("udp:0.0.0.0:5353".parse::<ExtraListener>().is_err());
        assert!("::".parse::<ExtraListener>().is_err());
        assert!("tcp:[::]:5300".parse::<ExtraListener>().is_err());
    }

    #[test]
    fn equality_is_by_endpoint() {
        let a: ExtraListener = "udp:192.0.2.1:53".parse().unwrap();
        let b: ExtraListener = "udp:192.0.2.1".parse().unwrap();
        let c: ExtraListener = "tcp:192.0.2.1:53".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn advertised_sizes_differ_by_scope() {
        assert_eq!(ListenerScope::Primary.advertised_udp_size(), 65494);
        assert_eq!(ListenerScope::Extra(0).advertised_udp_size(), 4096);
    }
}
