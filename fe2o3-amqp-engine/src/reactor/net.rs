//! TCP I/O for the reactor

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Instant,
};

use futures_util::future::select_all;
use tokio::{
    io::Interest,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::Notify,
};

use crate::{connection::Builder, endpoint::ConnectionId, handler::Handler};

use super::{Error, Reactor, Selectable};

/// Largest chunk read from a socket at once
const READ_BUF_SIZE: usize = 64 * 1024;

type MakeBuilder = Box<dyn Fn() -> Builder>;

pub(crate) struct Listener {
    listener: TcpListener,
    make_builder: MakeBuilder,
}

#[derive(Default)]
pub(crate) struct Io {
    pub(crate) listeners: Vec<Listener>,
    pub(crate) sockets: HashMap<ConnectionId, Socket>,
    pub(crate) notify: Arc<Notify>,
}

/// A TCP stream carrying the bytes of one connection
pub(crate) struct Socket {
    stream: TcpStream,
    read_closed: bool,
    write_closed: bool,
}

impl Socket {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_closed: false,
            write_closed: false,
        }
    }
}

impl Selectable for Socket {
    fn is_readable(&self) -> bool {
        !self.read_closed
    }

    fn is_writable(&self) -> bool {
        !self.write_closed
    }

    fn is_closed(&self) -> bool {
        self.read_closed && self.write_closed
    }

    #[cfg(unix)]
    fn handle(&self) -> Option<usize> {
        use std::os::unix::io::AsRawFd;
        usize::try_from(self.stream.as_raw_fd()).ok()
    }

    #[cfg(not(unix))]
    fn handle(&self) -> Option<usize> {
        None
    }
}

enum Readiness {
    Socket,
    Accepted(usize, io::Result<(TcpStream, SocketAddr)>),
    Woken,
}

type ReadinessFuture<'a> = Pin<Box<dyn Future<Output = Readiness> + 'a>>;

impl Reactor {
    /// Accepts TCP connections on `host:port`. Accepted connections are server
    /// connections with default settings whose events go to the default handlers.
    ///
    /// Returns the local address, which tells the port picked when `port` is 0.
    pub async fn listen(&mut self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        self.listen_with(host, port, Builder::new).await
    }

    /// Like [`listen`](Self::listen), with every accepted connection built from
    /// the builder returned by `make_builder`
    pub async fn listen_with(
        &mut self,
        host: &str,
        port: u16,
        make_builder: impl Fn() -> Builder + 'static,
    ) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;

        #[cfg(feature = "tracing")]
        tracing::info!(%addr, "listening");
        #[cfg(feature = "log")]
        log::info!("listening addr={}", addr);

        self.io.listeners.push(Listener {
            listener,
            make_builder: Box::new(make_builder),
        });
        Ok(addr)
    }

    /// Opens a TCP connection to `addr` and binds a connection built from
    /// `builder` to it
    pub async fn connect(
        &mut self,
        addr: impl ToSocketAddrs,
        builder: Builder,
        handler: Option<Box<dyn Handler>>,
    ) -> Result<ConnectionId, Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let id = self.connection_with(builder, handler);
        self.attach_socket(id, stream);
        Ok(id)
    }

    /// Wakes up a reactor waiting for I/O. The returned handle may be moved to
    /// other tasks and threads.
    pub fn waker(&self) -> Arc<Notify> {
        self.io.notify.clone()
    }

    /// Wakes up the reactor if it is waiting for I/O
    pub fn wakeup(&self) {
        self.io.notify.notify_one();
    }

    /// Runs passes until there is nothing more to do, waiting for socket
    /// readiness, timers or a wakeup between passes
    pub async fn run_async(&mut self) -> Result<(), Error> {
        self.start();
        loop {
            self.transfer_all();
            if !self.process()? {
                break;
            }
            self.transfer_all();
            self.wait().await?;
        }
        self.stop()
    }

    fn attach_socket(&mut self, id: ConnectionId, stream: TcpStream) {
        if let Some(conn) = self.connections.get_mut(id.0) {
            conn.transport_mut();
        }
        self.io.sockets.insert(id, Socket::new(stream));
    }

    async fn wait(&mut self) -> Result<(), Error> {
        let timeout = self.deadline().saturating_duration_since(Instant::now());
        let notify = self.io.notify.clone();

        let readiness = {
            let mut futures: Vec<ReadinessFuture<'_>> = Vec::new();
            for (id, socket) in self.io.sockets.iter() {
                let conn = match self.connections.get(id.0) {
                    Some(conn) => conn,
                    None => continue,
                };
                let transport = match conn.transport() {
                    Some(transport) => transport,
                    None => continue,
                };
                let readable = socket.is_readable() && transport.capacity().unwrap_or(0) > 0;
                let writable = socket.is_writable() && !transport.output.is_empty();
                let interest = match (readable, writable) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (true, false) => Interest::READABLE,
                    (false, true) => Interest::WRITABLE,
                    (false, false) => continue,
                };
                let stream = &socket.stream;
                futures.push(Box::pin(async move {
                    let _ = stream.ready(interest).await;
                    Readiness::Socket
                }));
            }
            for (index, listener) in self.io.listeners.iter().enumerate() {
                let listener = &listener.listener;
                futures.push(Box::pin(async move {
                    Readiness::Accepted(index, listener.accept().await)
                }));
            }
            futures.push(Box::pin(async move {
                notify.notified().await;
                Readiness::Woken
            }));

            match tokio::time::timeout(timeout, select_all(futures)).await {
                Ok((readiness, _, _)) => Some(readiness),
                Err(_elapsed) => None,
            }
        };

        match readiness {
            Some(Readiness::Accepted(index, Ok((stream, _peer)))) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(peer = %_peer, "accepted");
                #[cfg(feature = "log")]
                log::debug!("accepted peer={}", _peer);

                stream.set_nodelay(true)?;
                let builder = match self.io.listeners.get(index) {
                    Some(listener) => (listener.make_builder)().server(),
                    None => return Ok(()),
                };
                let id = self.connection_with(builder, None);
                self.attach_socket(id, stream);
            }
            Some(Readiness::Accepted(_, Err(_err))) => {
                #[cfg(feature = "tracing")]
                tracing::error!(err = ?_err, "accept failed");
                #[cfg(feature = "log")]
                log::error!("accept failed err={:?}", _err);
            }
            Some(Readiness::Socket) | Some(Readiness::Woken) | None => {}
        }
        Ok(())
    }

    fn transfer_all(&mut self) {
        let ids: Vec<ConnectionId> = self.io.sockets.keys().copied().collect();
        for id in ids {
            self.transfer(id);
        }
        let connections = &self.connections;
        self.io.sockets.retain(|id, socket| {
            !socket.is_closed() && connections.contains(id.0)
        });
    }

    fn transfer(&mut self, id: ConnectionId) {
        let (socket, conn) = match (
            self.io.sockets.get_mut(&id),
            self.connections.get_mut(id.0),
        ) {
            (Some(socket), Some(conn)) => (socket, conn),
            _ => return,
        };

        while !socket.read_closed {
            let capacity = match conn.capacity() {
                Some(0) => break,
                Some(capacity) => capacity.min(READ_BUF_SIZE),
                None => {
                    socket.read_closed = true;
                    break;
                }
            };
            let mut buf = vec![0u8; capacity];
            match socket.stream.try_read(&mut buf) {
                Ok(0) => {
                    socket.read_closed = true;
                    conn.close_tail();
                }
                Ok(n) => {
                    if let Err(_err) = conn.push(&buf[..n]) {
                        #[cfg(feature = "tracing")]
                        tracing::error!(err = ?_err, "push failed");
                        #[cfg(feature = "log")]
                        log::error!("push failed err={:?}", _err);
                        socket.read_closed = true;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(err = ?_err, "read failed");
                    #[cfg(feature = "log")]
                    log::error!("read failed err={:?}", _err);
                    socket.read_closed = true;
                    conn.close_tail();
                }
            }
        }

        while !socket.write_closed {
            let output = conn.peek_output();
            if output.is_empty() {
                break;
            }
            match socket.stream.try_write(output) {
                Ok(n) => conn.pop(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(err = ?_err, "write failed");
                    #[cfg(feature = "log")]
                    log::error!("write failed err={:?}", _err);
                    socket.write_closed = true;
                    conn.close_head();
                }
            }
        }

        if conn.transport().map(|t| t.is_head_closed()).unwrap_or(true) && conn.pending() == 0 {
            socket.write_closed = true;
        }
    }
}
