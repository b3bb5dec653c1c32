//! Per-device OSC streams.
//!
//! Sockets are bound on the main thread, so a failed bind fails the claim,
//! and are moved into the worker's runtime afterwards.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Bytes, BytesMut};
use chimaeraproto::framing::{decode_frame, MAX_FRAME_LEN};
use chimaeraproto::{Command, CommandBundle, ProtocolError, RequestIds, Transport};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A data socket bound but not yet attached to a runtime.
#[derive(Debug)]
pub enum BoundData {
    Udp(std::net::UdpSocket),
    Tcp(std::net::TcpListener),
}

impl BoundData {
    /// Bind an ephemeral port on `ip` for the device to send to.
    pub fn bind(transport: Transport, ip: Ipv4Addr) -> io::Result<Self> {
        let addr = SocketAddrV4::new(ip, 0);
        let bound = match transport {
            Transport::Udp => {
                let socket = std::net::UdpSocket::bind(addr)?;
                socket.set_nonblocking(true)?;
                BoundData::Udp(socket)
            }
            Transport::Tcp => {
                let listener = std::net::TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                BoundData::Tcp(listener)
            }
        };
        Ok(bound)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BoundData::Udp(socket) => socket.local_addr(),
            BoundData::Tcp(listener) => listener.local_addr(),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn attach(self) -> io::Result<DataStream> {
        Ok(match self {
            BoundData::Udp(socket) => DataStream::Udp {
                socket: UdpSocket::from_std(socket)?,
                buf: vec![0; MAX_FRAME_LEN],
            },
            BoundData::Tcp(listener) => DataStream::Tcp {
                listener: TcpListener::from_std(listener)?,
                conn: None,
                buf: BytesMut::with_capacity(4096),
            },
        })
    }
}

/// Incoming packets from a device. `recv` is cancel safe.
pub enum DataStream {
    Udp {
        socket: UdpSocket,
        buf: Vec<u8>,
    },
    /// The device connects in; packets are length-prefixed.
    Tcp {
        listener: TcpListener,
        conn: Option<TcpStream>,
        buf: BytesMut,
    },
}

impl DataStream {
    pub async fn recv(&mut self) -> Result<Bytes, StreamError> {
        match self {
            DataStream::Udp { socket, buf } => {
                let (n, _) = socket.recv_from(buf).await?;
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            DataStream::Tcp {
                listener,
                conn,
                buf,
            } => loop {
                if let Some(packet) = decode_frame(buf)? {
                    return Ok(packet);
                }
                match conn {
                    None => {
                        let (stream, peer) = listener.accept().await?;
                        info!(%peer, "data stream connected");
                        buf.clear();
                        *conn = Some(stream);
                    }
                    Some(stream) => {
                        if stream.read_buf(buf).await? == 0 {
                            debug!("data stream closed by device");
                            *conn = None;
                            buf.clear();
                        }
                    }
                }
            },
        }
    }
}

/// Unicast command stream to the device's configuration port.
pub struct CommandStream {
    socket: UdpSocket,
    ids: RequestIds,
    buf: Vec<u8>,
}

impl CommandStream {
    pub fn bind(device: SocketAddrV4) -> io::Result<std::net::UdpSocket> {
        let socket = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(device)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Must be called from within a tokio runtime.
    pub fn attach(socket: std::net::UdpSocket, first_id: i32) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            ids: RequestIds::new(first_id),
            buf: vec![0; MAX_FRAME_LEN],
        })
    }

    /// Send one command; returns its request id.
    pub async fn request(&mut self, command: &Command) -> Result<i32, StreamError> {
        let id = self.ids.next_id();
        let packet = command.encode(id)?;
        self.socket.send(&packet).await?;
        debug!(id, path = command.path(), "request sent");
        Ok(id)
    }

    pub async fn send_bundle(&mut self, bundle: &CommandBundle) -> Result<(), StreamError> {
        let packet = bundle.encode(&mut self.ids)?;
        self.socket.send(&packet).await?;
        debug!(paths = ?bundle.paths(), "bundle sent");
        Ok(())
    }

    /// Next datagram from the device. Cancel safe.
    pub async fn recv(&mut self) -> Result<Bytes, StreamError> {
        let n = self.socket.recv(&mut self.buf).await?;
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use chimaeraproto::framing::encode_frame;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_udp_data_stream() {
        let bound = BoundData::bind(Transport::Udp, Ipv4Addr::LOCALHOST).unwrap();
        let addr = bound.local_addr().unwrap();
        let mut stream = bound.attach().unwrap();

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device.send_to(b"/idle\0\0\0,\0\0\0", addr).await.unwrap();

        let packet = stream.recv().await.unwrap();
        assert_eq!(&packet[..], b"/idle\0\0\0,\0\0\0");
    }

    #[tokio::test]
    async fn test_tcp_data_stream_reassembles_frames() {
        let bound = BoundData::bind(Transport::Tcp, Ipv4Addr::LOCALHOST).unwrap();
        let addr = bound.local_addr().unwrap();
        let mut stream = bound.attach().unwrap();

        let mut wire = BytesMut::new();
        encode_frame(b"first", &mut wire).unwrap();
        encode_frame(b"second", &mut wire).unwrap();

        let writer = tokio::spawn(async move {
            let mut device = TcpStream::connect(addr).await.unwrap();
            // Split mid-header to force reassembly.
            device.write_all(&wire[..2]).await.unwrap();
            device.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            device.write_all(&wire[2..]).await.unwrap();
            device
        });

        assert_eq!(&stream.recv().await.unwrap()[..], b"first");
        assert_eq!(&stream.recv().await.unwrap()[..], b"second");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_command_stream_request_ids() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(device_addr) = device.local_addr().unwrap() else {
            panic!("expected v4");
        };
        let socket = CommandStream::bind(device_addr).unwrap();
        let mut stream = CommandStream::attach(socket, 100).unwrap();

        let first = stream.request(&Command::ConfigSave).await.unwrap();
        let second = stream.request(&Command::ResetSoft).await.unwrap();
        assert_eq!(second, first + 1);

        let mut buf = [0u8; 256];
        let (n, _) = device.recv_from(&mut buf).await.unwrap();
        let mut expected = BytesMut::new();
        expected.put_slice(&Command::ConfigSave.encode(first).unwrap());
        assert_eq!(&buf[..n], &expected[..]);
    }
}
