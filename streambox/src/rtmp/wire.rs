use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::rtmp::RtmpError;
use crate::StreamCounters;

/// Owns the TCP connection to the ingest server.
///
/// All bytes leave through [`RtmpWire::write`], which accounts them into the
/// shared counters. The socket runs with Nagle disabled; reads are either
/// deadline-bounded (handshake) or non-blocking (steady-state drain).
pub struct RtmpWire {
    socket: TcpStream,
    counters: Arc<StreamCounters>,
    poll_interval: Duration,
    recv_buf: Vec<u8>,
}

impl RtmpWire {
    pub fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        poll_interval: Duration,
        counters: Arc<StreamCounters>,
    ) -> Result<Self, RtmpError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| RtmpError::HostNotFound(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(RtmpError::HostNotFound(host.to_string()));
        }

        let mut last_error = None;
        let mut socket = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    socket = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let socket = match socket {
            Some(socket) => socket,
            None => {
                let error = last_error.unwrap_or_else(|| ErrorKind::TimedOut.into());
                return Err(match error.kind() {
                    ErrorKind::ConnectionRefused => RtmpError::ConnectionRefused(host.to_string()),
                    ErrorKind::PermissionDenied => RtmpError::AccessDenied,
                    _ => RtmpError::ConnectFailed(host.to_string(), error),
                });
            }
        };

        socket.set_nodelay(true).map_err(RtmpError::SocketWrite)?;
        debug!("connected to {host}:{port}");

        Ok(RtmpWire {
            socket,
            counters,
            poll_interval,
            recv_buf: Vec::new(),
        })
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RtmpError> {
        self.socket.write_all(bytes).map_err(map_write_error)?;
        self.counters.record_bytes_written(bytes.len() as u64);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RtmpError> {
        self.socket.flush().map_err(map_write_error)
    }

    /// Reads exactly `buf.len()` bytes, polling in short intervals so a stop
    /// request or the deadline interrupts the wait within one interval.
    pub fn read_exact_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        stop: &AtomicBool,
    ) -> Result<(), RtmpError> {
        self.socket
            .set_read_timeout(Some(self.poll_interval))
            .map_err(RtmpError::SocketRead)?;

        let mut filled = 0;
        while filled < buf.len() {
            if stop.load(Ordering::Relaxed) {
                return Err(RtmpError::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(RtmpError::HandshakeTimeout);
            }

            match self.socket.read(&mut buf[filled..]) {
                Ok(0) => return Err(RtmpError::RemoteClosed),
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    trace!("still waiting for {} handshake bytes", buf.len() - filled);
                }
                Err(e) => return Err(RtmpError::SocketRead(e)),
            }
        }

        Ok(())
    }

    /// Reads whatever the server has sent without blocking. Returns the
    /// drained bytes, which stay valid until the next call.
    pub fn drain(&mut self) -> Result<&[u8], RtmpError> {
        self.recv_buf.clear();
        self.socket
            .set_nonblocking(true)
            .map_err(RtmpError::SocketRead)?;

        let mut scratch = [0u8; 4096];
        let result = loop {
            match self.socket.read(&mut scratch) {
                Ok(0) => break Err(RtmpError::RemoteClosed),
                Ok(n) => self.recv_buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(RtmpError::SocketRead(e)),
            }
        };

        self.socket
            .set_nonblocking(false)
            .map_err(RtmpError::SocketRead)?;

        result.map(|_| &self.recv_buf[..])
    }

    pub fn shutdown(&mut self) {
        let _ = self.socket.flush();
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

fn map_write_error(error: std::io::Error) -> RtmpError {
    match error.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            RtmpError::RemoteClosed
        }
        ErrorKind::PermissionDenied => RtmpError::AccessDenied,
        _ => RtmpError::SocketWrite(error),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn wire_pair() -> (RtmpWire, TcpStream, Arc<StreamCounters>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = thread::spawn(move || listener.accept().unwrap().0);

        let counters = Arc::new(StreamCounters::default());
        let wire = RtmpWire::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(5),
            Duration::from_millis(20),
            counters.clone(),
        )
        .unwrap();

        (wire, accept.join().unwrap(), counters)
    }

    #[test]
    fn write_counts_bytes() {
        let (mut wire, mut peer, counters) = wire_pair();

        wire.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(4, counters.bytes_written());

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!([1, 2, 3, 4], buf);
    }

    #[test]
    fn drain_returns_pending_bytes_without_blocking() {
        let (mut wire, mut peer, _) = wire_pair();

        assert!(wire.drain().unwrap().is_empty());

        peer.write_all(&[9, 9, 9]).unwrap();
        peer.flush().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(&[9, 9, 9], wire.drain().unwrap());
    }

    #[test]
    fn read_deadline_times_out() {
        let (mut wire, _peer, _) = wire_pair();

        let mut buf = [0u8; 8];
        let stop = AtomicBool::new(false);
        let deadline = Instant::now() + Duration::from_millis(60);

        let err = wire.read_exact_deadline(&mut buf, deadline, &stop).unwrap_err();
        assert!(matches!(err, RtmpError::HandshakeTimeout));
    }

    #[test]
    fn stop_interrupts_read() {
        let (mut wire, _peer, _) = wire_pair();

        let mut buf = [0u8; 8];
        let stop = AtomicBool::new(true);
        let deadline = Instant::now() + Duration::from_secs(120);

        let err = wire.read_exact_deadline(&mut buf, deadline, &stop).unwrap_err();
        assert!(matches!(err, RtmpError::Interrupted));
    }
}
