/*
 * Copyright (C) 2024-2025 the Zibai authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::error;
use socket2::{Domain, SockAddr, Socket, Type};
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

/// A configured listen endpoint, before binding.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ListenSpec {
    Tcp { addr: SocketAddr, dualstack: bool },
    Unix { path: PathBuf, mode: u32 },
}

impl ListenSpec {
    /// Parse `HOST:PORT` or `unix:PATH`. An empty host binds the wildcard
    /// address (`::` when dualstack is requested, else `0.0.0.0`).
    pub fn parse(value: &str, dualstack: bool, unix_perms: u32) -> Result<Self, Box<dyn Error>> {
        if let Some(path) = value.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("unix socket path cannot be empty".into());
            }

            return Ok(Self::Unix {
                path: PathBuf::from(path),
                mode: unix_perms,
            });
        }

        let pos = match value.rfind(':') {
            Some(pos) => pos,
            None => return Err("listen must be of the form HOST:PORT or unix:PATH".into()),
        };

        let (host, port) = (&value[..pos], &value[(pos + 1)..]);

        let port: u16 = match port.parse() {
            Ok(x) => x,
            Err(_) => return Err("listen port must be an integer between 1 and 65535".into()),
        };

        if port == 0 {
            return Err("listen port must be an integer between 1 and 65535".into());
        }

        let host = if host.is_empty() {
            if dualstack {
                "::"
            } else {
                "0.0.0.0"
            }
        } else {
            host
        };

        // bracketed ipv6 literals are accepted for symmetry with URLs
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let ip: IpAddr = match host.parse() {
            Ok(x) => x,
            Err(e) => return Err(format!("failed to parse listen host: {}", e).into()),
        };

        if dualstack && !ip.is_ipv6() {
            return Err("dualstack requires an ipv6 listen address".into());
        }

        Ok(Self::Tcp {
            addr: SocketAddr::new(ip, port),
            dualstack,
        })
    }

    pub fn bind(&self, backlog: Option<i32>) -> Result<NetListener, Box<dyn Error>> {
        let backlog = backlog.unwrap_or(libc::SOMAXCONN);

        match self {
            Self::Tcp { addr, dualstack } => {
                let domain = Domain::for_address(*addr);
                let socket = Socket::new(domain, Type::STREAM, None)?;

                if *dualstack {
                    socket.set_only_v6(false)?;
                }

                socket.set_reuse_port(true)?;
                socket.bind(&SockAddr::from(*addr))?;
                socket.listen(backlog)?;

                Ok(NetListener::Tcp(socket.into()))
            }
            Self::Unix { path, mode } => {
                if path.exists() {
                    fs::remove_file(path)?;
                }

                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.bind(&SockAddr::unix(path)?)?;
                fs::set_permissions(path, fs::Permissions::from_mode(*mode))?;
                socket.listen(backlog)?;

                Ok(NetListener::Unix(socket.into()))
            }
        }
    }
}

/// A bound listening socket, tcp or unix.
#[derive(Debug)]
pub enum NetListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl NetListener {
    pub fn accept(&self) -> io::Result<(NetStream, PeerAddr)> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                set_socket_opts(&stream);

                Ok((
                    NetStream::Tcp(stream),
                    PeerAddr {
                        addr: peer.ip().to_string(),
                        port: peer.port(),
                    },
                ))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept()?;

                Ok((
                    NetStream::Unix(stream),
                    PeerAddr {
                        addr: String::new(),
                        port: 0,
                    },
                ))
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.set_nonblocking(nonblocking),
            Self::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    /// Default SERVER_NAME/SERVER_PORT for connections accepted here, used
    /// when the request carries no Host header.
    pub fn server_addr(&self) -> (String, u16) {
        match self {
            Self::Tcp(l) => match l.local_addr() {
                Ok(addr) => (addr.ip().to_string(), addr.port()),
                Err(_) => (String::new(), 0),
            },
            Self::Unix(l) => match l.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => (path.display().to_string(), 0),
                    None => (String::new(), 0),
                },
                Err(_) => (String::new(), 0),
            },
        }
    }

    pub fn local_display(&self) -> String {
        match self {
            Self::Tcp(l) => match l.local_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "?".to_string(),
            },
            Self::Unix(l) => match l.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => format!("unix:{}", path.display()),
                    None => "unix:?".to_string(),
                },
                Err(_) => "unix:?".to_string(),
            },
        }
    }

    /// Allow the descriptor to survive exec, for handing to worker
    /// processes.
    pub fn set_inheritable(&self) -> io::Result<()> {
        let fd = self.as_raw_fd();

        // SAFETY: fd is a valid open descriptor owned by self
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Rebuild a listener from an inherited descriptor, detecting the
    /// address family from the socket itself.
    pub fn from_inherited_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: the fd was inherited from the supervisor and is owned by
        // the returned listener from here on
        let socket = unsafe { Socket::from_raw_fd(fd) };

        let local = socket.local_addr()?;

        if local.is_unix() {
            Ok(Self::Unix(socket.into()))
        } else {
            Ok(Self::Tcp(socket.into()))
        }
    }
}

impl AsRawFd for NetListener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(l) => l.as_raw_fd(),
            Self::Unix(l) => l.as_raw_fd(),
        }
    }
}

fn set_socket_opts(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        error!("set nodelay failed: {:?}", e);
    }
}

/// An accepted connection, tcp or unix.
#[derive(Debug)]
pub enum NetStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl NetStream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(nonblocking),
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout),
            Self::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            Self::Unix(s) => s.shutdown(how),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(s) => Ok(Self::Tcp(s.try_clone()?)),
            Self::Unix(s) => Ok(Self::Unix(s.try_clone()?)),
        }
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

/// Peer address of an accepted connection. Unix peers have an empty
/// address and port 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub addr: String,
    pub port: u16,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            ListenSpec::parse("127.0.0.1:8000", false, 0o600).unwrap(),
            ListenSpec::Tcp {
                addr: "127.0.0.1:8000".parse().unwrap(),
                dualstack: false,
            }
        );

        assert_eq!(
            ListenSpec::parse(":9000", false, 0o600).unwrap(),
            ListenSpec::Tcp {
                addr: "0.0.0.0:9000".parse().unwrap(),
                dualstack: false,
            }
        );

        assert_eq!(
            ListenSpec::parse(":9000", true, 0o600).unwrap(),
            ListenSpec::Tcp {
                addr: "[::]:9000".parse().unwrap(),
                dualstack: true,
            }
        );

        assert_eq!(
            ListenSpec::parse("[::1]:9000", false, 0o600).unwrap(),
            ListenSpec::Tcp {
                addr: "[::1]:9000".parse().unwrap(),
                dualstack: false,
            }
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            ListenSpec::parse("unix:/tmp/app.sock", false, 0o660).unwrap(),
            ListenSpec::Unix {
                path: PathBuf::from("/tmp/app.sock"),
                mode: 0o660,
            }
        );
    }

    #[test]
    fn test_parse_rejects() {
        assert!(ListenSpec::parse("8000", false, 0o600).is_err());
        assert!(ListenSpec::parse("127.0.0.1:notaport", false, 0o600).is_err());
        assert!(ListenSpec::parse("127.0.0.1:0", false, 0o600).is_err());
        assert!(ListenSpec::parse("localhost:8000", false, 0o600).is_err());
        assert!(ListenSpec::parse("unix:", false, 0o600).is_err());
        assert!(ListenSpec::parse("127.0.0.1:8000", true, 0o600).is_err());
    }

    #[test]
    fn test_bind_ephemeral() {
        let spec = ListenSpec::Tcp {
            addr: "127.0.0.1:0".parse().unwrap(),
            dualstack: false,
        };

        // port 0 is rejected by parse but usable directly for tests
        let listener = spec.bind(None).unwrap();
        let (name, port) = listener.server_addr();
        assert_eq!(name, "127.0.0.1");
        assert_ne!(port, 0);
    }
}
