//! Socket options: `(level, name)` dispatch over typed values.

use std::time::Duration;

use crate::error::{Result, ZtsError};
use crate::model::{AddressFamily, IPPROTO_IP, IPPROTO_IPV6, IPPROTO_TCP};
use crate::stack::ConnKind;

pub const SOL_SOCKET: i32 = 0x0fff;

pub const SO_DEBUG: i32 = 0x0001;
pub const SO_ACCEPTCONN: i32 = 0x0002;
pub const SO_REUSEADDR: i32 = 0x0004;
pub const SO_KEEPALIVE: i32 = 0x0008;
pub const SO_DONTROUTE: i32 = 0x0010;
pub const SO_BROADCAST: i32 = 0x0020;
pub const SO_USELOOPBACK: i32 = 0x0040;
pub const SO_LINGER: i32 = 0x0080;
pub const SO_OOBINLINE: i32 = 0x0100;
pub const SO_REUSEPORT: i32 = 0x0200;
pub const SO_SNDBUF: i32 = 0x1001;
pub const SO_RCVBUF: i32 = 0x1002;
pub const SO_SNDLOWAT: i32 = 0x1003;
pub const SO_RCVLOWAT: i32 = 0x1004;
pub const SO_SNDTIMEO: i32 = 0x1005;
pub const SO_RCVTIMEO: i32 = 0x1006;
pub const SO_ERROR: i32 = 0x1007;
pub const SO_TYPE: i32 = 0x1008;
pub const SO_CONTIMEO: i32 = 0x1009;
pub const SO_NO_CHECK: i32 = 0x100a;

pub const IP_TOS: i32 = 0x0001;
pub const IP_TTL: i32 = 0x0002;

pub const TCP_NODELAY: i32 = 0x0001;
pub const TCP_KEEPALIVE: i32 = 0x0002;
pub const TCP_KEEPIDLE: i32 = 0x0003;
pub const TCP_KEEPINTVL: i32 = 0x0004;
pub const TCP_KEEPCNT: i32 = 0x0005;

pub const IPV6_CHECKSUM: i32 = 0x0007;
pub const IPV6_V6ONLY: i32 = 0x001b;

const DEFAULT_TTL: i32 = 255;
const DEFAULT_KEEPIDLE_MS: i32 = 7_200_000;
const DEFAULT_KEEPINTVL_S: i32 = 75;
const DEFAULT_KEEPCNT: i32 = 9;

/// Typed option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Int(i32),
    /// `None` is linger off; `Some(ZERO)` makes close abortive.
    Linger(Option<Duration>),
    /// Zero means no timeout.
    Duration(Duration),
}

impl OptionValue {
    pub fn as_int(self) -> Result<i32> {
        match self {
            OptionValue::Int(v) => Ok(v),
            _ => Err(ZtsError::InvalidArgument("option expects an integer")),
        }
    }

    fn flag(self) -> Result<bool> {
        self.as_int().map(|v| v != 0)
    }

    fn timeout(self) -> Result<Option<Duration>> {
        match self {
            OptionValue::Duration(d) if d.is_zero() => Ok(None),
            OptionValue::Duration(d) => Ok(Some(d)),
            _ => Err(ZtsError::InvalidArgument("option expects a duration")),
        }
    }
}

/// A supported option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    ReuseAddr,
    KeepAlive,
    Broadcast,
    Linger,
    RecvBuffer,
    SendTimeout,
    RecvTimeout,
    ConnectTimeout,
    NoCheck,
    Error,
    Type,
    AcceptConn,
    TcpNoDelay,
    TcpKeepAlive,
    TcpKeepIdle,
    TcpKeepIntvl,
    TcpKeepCnt,
    IpTos,
    IpTtl,
    Ipv6V6Only,
}

impl SockOpt {
    pub fn from_raw(level: i32, name: i32) -> Result<Self> {
        let opt = match (level, name) {
            (SOL_SOCKET, SO_REUSEADDR) => SockOpt::ReuseAddr,
            (SOL_SOCKET, SO_KEEPALIVE) => SockOpt::KeepAlive,
            (SOL_SOCKET, SO_BROADCAST) => SockOpt::Broadcast,
            (SOL_SOCKET, SO_LINGER) => SockOpt::Linger,
            (SOL_SOCKET, SO_RCVBUF) => SockOpt::RecvBuffer,
            (SOL_SOCKET, SO_SNDTIMEO) => SockOpt::SendTimeout,
            (SOL_SOCKET, SO_RCVTIMEO) => SockOpt::RecvTimeout,
            (SOL_SOCKET, SO_CONTIMEO) => SockOpt::ConnectTimeout,
            (SOL_SOCKET, SO_NO_CHECK) => SockOpt::NoCheck,
            (SOL_SOCKET, SO_ERROR) => SockOpt::Error,
            (SOL_SOCKET, SO_TYPE) => SockOpt::Type,
            (SOL_SOCKET, SO_ACCEPTCONN) => SockOpt::AcceptConn,
            (IPPROTO_TCP, TCP_NODELAY) => SockOpt::TcpNoDelay,
            (IPPROTO_TCP, TCP_KEEPALIVE) => SockOpt::TcpKeepAlive,
            (IPPROTO_TCP, TCP_KEEPIDLE) => SockOpt::TcpKeepIdle,
            (IPPROTO_TCP, TCP_KEEPINTVL) => SockOpt::TcpKeepIntvl,
            (IPPROTO_TCP, TCP_KEEPCNT) => SockOpt::TcpKeepCnt,
            (IPPROTO_IP, IP_TOS) => SockOpt::IpTos,
            (IPPROTO_IP, IP_TTL) => SockOpt::IpTtl,
            (IPPROTO_IPV6, IPV6_V6ONLY) => SockOpt::Ipv6V6Only,
            _ => return Err(ZtsError::InvalidArgument("unsupported socket option")),
        };
        Ok(opt)
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, SockOpt::Error | SockOpt::Type | SockOpt::AcceptConn)
    }

    fn is_tcp(self) -> bool {
        matches!(
            self,
            SockOpt::TcpNoDelay
                | SockOpt::TcpKeepAlive
                | SockOpt::TcpKeepIdle
                | SockOpt::TcpKeepIntvl
                | SockOpt::TcpKeepCnt
        )
    }
}

/// Per-socket option values kept by the socket table. SO_RCVBUF lives in the
/// stack; SO_ERROR, SO_TYPE and SO_ACCEPTCONN are derived from socket state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub reuseaddr: bool,
    pub keepalive: bool,
    pub broadcast: bool,
    pub linger: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    default_connect_timeout: Duration,
    pub no_check: bool,
    pub tcp_nodelay: bool,
    pub tcp_keepidle_ms: i32,
    pub tcp_keepintvl_s: i32,
    pub tcp_keepcnt: i32,
    pub ip_tos: i32,
    pub ip_ttl: i32,
    pub v6only: bool,
}

impl SocketOptions {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            reuseaddr: false,
            keepalive: false,
            broadcast: false,
            linger: None,
            send_timeout: None,
            recv_timeout: None,
            connect_timeout,
            default_connect_timeout: connect_timeout,
            no_check: false,
            tcp_nodelay: false,
            tcp_keepidle_ms: DEFAULT_KEEPIDLE_MS,
            tcp_keepintvl_s: DEFAULT_KEEPINTVL_S,
            tcp_keepcnt: DEFAULT_KEEPCNT,
            ip_tos: 0,
            ip_ttl: DEFAULT_TTL,
            v6only: false,
        }
    }

    /// Close sends RST instead of draining.
    pub fn abortive_close(&self) -> bool {
        self.linger == Some(Duration::ZERO)
    }

    /// Check that `opt` applies to a socket of this kind and family.
    pub fn check_applies(opt: SockOpt, kind: ConnKind, family: AddressFamily) -> Result<()> {
        if opt.is_tcp() && kind != ConnKind::Stream {
            return Err(ZtsError::InvalidArgument("tcp option on a datagram socket"));
        }
        if opt == SockOpt::Ipv6V6Only && family != AddressFamily::Inet6 {
            return Err(ZtsError::InvalidArgument("IPV6_V6ONLY on an ipv4 socket"));
        }
        Ok(())
    }

    /// Store a value. Read-only options and SO_RCVBUF are not handled here.
    pub fn set(&mut self, opt: SockOpt, value: OptionValue) -> Result<()> {
        match opt {
            SockOpt::ReuseAddr => self.reuseaddr = value.flag()?,
            SockOpt::KeepAlive => self.keepalive = value.flag()?,
            SockOpt::Broadcast => self.broadcast = value.flag()?,
            SockOpt::NoCheck => self.no_check = value.flag()?,
            SockOpt::TcpNoDelay => self.tcp_nodelay = value.flag()?,
            SockOpt::Ipv6V6Only => self.v6only = value.flag()?,
            SockOpt::Linger => match value {
                OptionValue::Linger(l) => self.linger = l,
                _ => return Err(ZtsError::InvalidArgument("SO_LINGER expects a linger value")),
            },
            SockOpt::SendTimeout => self.send_timeout = value.timeout()?,
            SockOpt::RecvTimeout => self.recv_timeout = value.timeout()?,
            SockOpt::ConnectTimeout => {
                self.connect_timeout = value.timeout()?.unwrap_or(self.default_connect_timeout)
            }
            SockOpt::TcpKeepAlive => self.tcp_keepidle_ms = positive(value)?,
            SockOpt::TcpKeepIdle => {
                self.tcp_keepidle_ms = positive(value)?.saturating_mul(1000)
            }
            SockOpt::TcpKeepIntvl => self.tcp_keepintvl_s = positive(value)?,
            SockOpt::TcpKeepCnt => self.tcp_keepcnt = positive(value)?,
            SockOpt::IpTos => self.ip_tos = in_range(value, 0, 255)?,
            SockOpt::IpTtl => self.ip_ttl = in_range(value, 1, 255)?,
            SockOpt::RecvBuffer | SockOpt::Error | SockOpt::Type | SockOpt::AcceptConn => {
                return Err(ZtsError::InvalidArgument("option is read-only"))
            }
        }
        Ok(())
    }

    /// Stored value, `None` for options the socket table derives.
    pub fn get(&self, opt: SockOpt) -> Option<OptionValue> {
        let int = |b: bool| OptionValue::Int(i32::from(b));
        let timeout = |t: Option<Duration>| OptionValue::Duration(t.unwrap_or(Duration::ZERO));
        Some(match opt {
            SockOpt::ReuseAddr => int(self.reuseaddr),
            SockOpt::KeepAlive => int(self.keepalive),
            SockOpt::Broadcast => int(self.broadcast),
            SockOpt::NoCheck => int(self.no_check),
            SockOpt::TcpNoDelay => int(self.tcp_nodelay),
            SockOpt::Ipv6V6Only => int(self.v6only),
            SockOpt::Linger => OptionValue::Linger(self.linger),
            SockOpt::SendTimeout => timeout(self.send_timeout),
            SockOpt::RecvTimeout => timeout(self.recv_timeout),
            SockOpt::ConnectTimeout => OptionValue::Duration(self.connect_timeout),
            SockOpt::TcpKeepAlive => OptionValue::Int(self.tcp_keepidle_ms),
            SockOpt::TcpKeepIdle => OptionValue::Int(self.tcp_keepidle_ms / 1000),
            SockOpt::TcpKeepIntvl => OptionValue::Int(self.tcp_keepintvl_s),
            SockOpt::TcpKeepCnt => OptionValue::Int(self.tcp_keepcnt),
            SockOpt::IpTos => OptionValue::Int(self.ip_tos),
            SockOpt::IpTtl => OptionValue::Int(self.ip_ttl),
            SockOpt::RecvBuffer | SockOpt::Error | SockOpt::Type | SockOpt::AcceptConn => {
                return None
            }
        })
    }
}

fn positive(value: OptionValue) -> Result<i32> {
    let v = value.as_int()?;
    if v <= 0 {
        return Err(ZtsError::InvalidArgument("option value must be positive"));
    }
    Ok(v)
}

fn in_range(value: OptionValue, lo: i32, hi: i32) -> Result<i32> {
    let v = value.as_int()?;
    if !(lo..=hi).contains(&v) {
        return Err(ZtsError::InvalidArgument("option value out of range"));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_by_level_and_name() {
        assert_eq!(SockOpt::from_raw(SOL_SOCKET, SO_RCVTIMEO).unwrap(), SockOpt::RecvTimeout);
        assert_eq!(SockOpt::from_raw(IPPROTO_TCP, TCP_NODELAY).unwrap(), SockOpt::TcpNoDelay);
        assert_eq!(SockOpt::from_raw(IPPROTO_IP, IP_TTL).unwrap(), SockOpt::IpTtl);
        assert!(SockOpt::from_raw(SOL_SOCKET, SO_SNDBUF).is_err());
        assert!(SockOpt::from_raw(SOL_SOCKET, SO_OOBINLINE).is_err());
        assert!(SockOpt::from_raw(IPPROTO_IPV6, IPV6_CHECKSUM).is_err());
        assert!(SockOpt::from_raw(0x1234, SO_REUSEADDR).is_err());
    }

    #[test]
    fn applicability() {
        use AddressFamily::*;
        assert!(SocketOptions::check_applies(SockOpt::TcpNoDelay, ConnKind::Datagram, Inet).is_err());
        assert!(SocketOptions::check_applies(SockOpt::TcpNoDelay, ConnKind::Stream, Inet).is_ok());
        assert!(SocketOptions::check_applies(SockOpt::Ipv6V6Only, ConnKind::Stream, Inet).is_err());
        assert!(SocketOptions::check_applies(SockOpt::Ipv6V6Only, ConnKind::Stream, Inet6).is_ok());
    }

    #[test]
    fn timeouts_and_linger() {
        let mut o = SocketOptions::new(Duration::from_secs(20));
        o.set(SockOpt::RecvTimeout, OptionValue::Duration(Duration::from_millis(250))).unwrap();
        assert_eq!(o.recv_timeout, Some(Duration::from_millis(250)));
        o.set(SockOpt::RecvTimeout, OptionValue::Duration(Duration::ZERO)).unwrap();
        assert_eq!(o.recv_timeout, None);
        assert!(o.set(SockOpt::SendTimeout, OptionValue::Int(5)).is_err());

        o.set(SockOpt::ConnectTimeout, OptionValue::Duration(Duration::from_secs(2))).unwrap();
        assert_eq!(o.connect_timeout, Duration::from_secs(2));
        o.set(SockOpt::ConnectTimeout, OptionValue::Duration(Duration::ZERO)).unwrap();
        assert_eq!(o.connect_timeout, Duration::from_secs(20));

        assert!(!o.abortive_close());
        o.set(SockOpt::Linger, OptionValue::Linger(Some(Duration::ZERO))).unwrap();
        assert!(o.abortive_close());
        assert_eq!(o.get(SockOpt::Linger), Some(OptionValue::Linger(Some(Duration::ZERO))));
    }

    #[test]
    fn integer_options_are_validated() {
        let mut o = SocketOptions::new(Duration::from_secs(20));
        o.set(SockOpt::ReuseAddr, OptionValue::Int(1)).unwrap();
        assert_eq!(o.get(SockOpt::ReuseAddr), Some(OptionValue::Int(1)));
        o.set(SockOpt::TcpKeepIdle, OptionValue::Int(30)).unwrap();
        assert_eq!(o.get(SockOpt::TcpKeepAlive), Some(OptionValue::Int(30_000)));
        assert!(o.set(SockOpt::TcpKeepCnt, OptionValue::Int(0)).is_err());
        assert!(o.set(SockOpt::IpTtl, OptionValue::Int(0)).is_err());
        assert!(o.set(SockOpt::IpTos, OptionValue::Int(256)).is_err());
        assert!(o.set(SockOpt::Error, OptionValue::Int(0)).is_err());
        assert_eq!(o.get(SockOpt::Type), None);
    }
}
