use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use socket2::{Domain, Socket, Type};

pub const HELLO_SIZE: usize = 16;

/// First bytes written on every data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub magic: u64,
    pub rank: u32,
    pub level: u32,
}

impl Hello {
    pub fn encode(&self) -> [u8; HELLO_SIZE] {
        let mut buf = [0u8; HELLO_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.magic);
        LittleEndian::write_u32(&mut buf[8..12], self.rank);
        LittleEndian::write_u32(&mut buf[12..16], self.level);
        buf
    }

    pub fn decode(buf: &[u8; HELLO_SIZE]) -> Self {
        Hello {
            magic: LittleEndian::read_u64(&buf[0..8]),
            rank: LittleEndian::read_u32(&buf[8..12]),
            level: LittleEndian::read_u32(&buf[12..16]),
        }
    }
}

fn new_socket(addr: &SocketAddr) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

pub fn listen(addr: &SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = new_socket(addr)?;
    socket.set_reuse_port(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Connects to `remote` from a socket bound to `local_ip`, so the traffic
/// leaves through the interface of that level.
pub fn connect_from(local_ip: IpAddr, remote: &SocketAddr) -> std::io::Result<TcpStream> {
    let socket = new_socket(remote)?;
    socket.bind(&SocketAddr::new(local_ip, 0).into())?;
    socket.connect(&(*remote).into())?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

pub fn write_hello(stream: &mut TcpStream, hello: &Hello) -> std::io::Result<()> {
    stream.write_all(&hello.encode())
}

pub fn read_hello(stream: &mut TcpStream, timeout: Duration) -> std::io::Result<Hello> {
    let mut buf = [0u8; HELLO_SIZE];
    stream.set_read_timeout(Some(timeout))?;
    stream.read_exact(&mut buf)?;
    stream.set_read_timeout(None)?;
    Ok(Hello::decode(&buf))
}

/// Polls a non-blocking listener once. Connections that do not open with
/// `magic` are logged and dropped; `Ok(None)` means nothing is pending.
pub fn try_accept(
    listener: &TcpListener,
    magic: u64,
    hello_timeout: Duration,
) -> std::io::Result<Option<(TcpStream, Hello)>> {
    loop {
        let (mut stream, addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let hello = match read_hello(&mut stream, hello_timeout) {
            Ok(hello) => hello,
            Err(e) => {
                log::warn!("TCP listener accept: no hello from {}: {}", addr, e);
                continue;
            }
        };
        if hello.magic == magic {
            return Ok(Some((stream, hello)));
        }
        log::warn!(
            "TCP listener accept: invalid magic {} != {} from {}",
            hello.magic,
            magic,
            addr
        );
    }
}
