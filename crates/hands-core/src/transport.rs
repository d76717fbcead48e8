//! Local byte-stream channels
//!
//! A channel is addressed by a prefix plus the process id of the agent that
//! listens on it, so a controller can reach one specific agent instance.
//! Unix realizes it as a domain socket; Windows as a loopback TCP listener
//! whose port is published in a small file next to where the socket would be.

use hands_common::{ChannelState, Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::net::{UnixListener as Listener, UnixStream as Stream};

#[cfg(windows)]
use std::net::{TcpListener as Listener, TcpStream as Stream};

/// The stream type handed out by [`LocalChannel`].
pub type LocalStream = Stream;

/// Address of a channel: `<prefix><pid>` inside a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName {
    prefix: String,
    pid: u32,
    dir: PathBuf,
}

impl ChannelName {
    pub fn new(prefix: impl Into<String>, pid: u32, dir: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            pid,
            dir: dir.into(),
        }
    }

    /// Name for a channel owned by the calling process.
    pub fn for_current_process(prefix: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self::new(prefix, std::process::id(), dir)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join(format!("{}.sock", self))
    }

    pub fn port_file(&self) -> PathBuf {
        self.dir.join(format!("{}.port", self))
    }

    /// File whose existence marks a listening channel.
    pub fn endpoint_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.port_file()
        } else {
            self.socket_path()
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.pid)
    }
}

/// A connected byte stream as handed out by a channel.
pub trait ChannelStream: Read + Write + Send + 'static {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

#[cfg(unix)]
impl ChannelStream for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }
}

impl ChannelStream for std::net::TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, timeout)
    }
}

/// Listening end of a bidirectional byte-stream channel with one peer at a time.
pub trait Channel: Send + Sync {
    type Stream: ChannelStream;

    fn name(&self) -> &ChannelName;

    fn state(&self) -> ChannelState;

    /// Block until a peer connects. The returned stream is an independent
    /// handle to the connection; the channel keeps its own for probing.
    fn wait_for_connection(&self) -> Result<Self::Stream>;

    /// Non-blocking liveness probe of the current peer.
    fn is_connected(&self) -> bool;

    /// Drop the current peer. Streams handed out for it observe end of file.
    fn disconnect(&self) -> Result<()>;

    /// Record that I/O on the current peer failed.
    fn mark_broken(&self);

    /// Terminal teardown; removes the endpoint.
    fn close(&self) -> Result<()>;
}

struct Session {
    state: ChannelState,
    peer: Option<Stream>,
}

/// Channel over the platform's local socket.
pub struct LocalChannel {
    name: ChannelName,
    listener: Listener,
    session: Mutex<Session>,
}

impl LocalChannel {
    /// Create the endpoint and start listening.
    #[cfg(unix)]
    pub fn listen(name: ChannelName) -> Result<Self> {
        let path = name.socket_path();
        if path.exists() {
            // Stale socket from an earlier process with a recycled pid.
            debug!(target: "hands_core::transport", path = %path.display(), "Removing stale socket");
            let _ = std::fs::remove_file(&path);
        }

        let listener = Listener::bind(&path)?;
        info!(target: "hands_core::transport", channel = %name, path = %path.display(), "Channel listening");

        Ok(Self::with_listener(name, listener))
    }

    #[cfg(windows)]
    pub fn listen(name: ChannelName) -> Result<Self> {
        let listener = Listener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        std::fs::write(name.port_file(), port.to_string())?;
        info!(target: "hands_core::transport", channel = %name, port, "Channel listening");

        Ok(Self::with_listener(name, listener))
    }

    fn with_listener(name: ChannelName, listener: Listener) -> Self {
        Self {
            name,
            listener,
            session: Mutex::new(Session {
                state: ChannelState::WaitingToConnect,
                peer: None,
            }),
        }
    }

    fn shutdown_peer(peer: Option<Stream>) {
        if let Some(peer) = peer {
            let _ = peer.shutdown(Shutdown::Both);
        }
    }
}

impl Channel for LocalChannel {
    type Stream = Stream;

    fn name(&self) -> &ChannelName {
        &self.name
    }

    fn state(&self) -> ChannelState {
        self.session.lock().state
    }

    fn wait_for_connection(&self) -> Result<Stream> {
        {
            let mut session = self.session.lock();
            match session.state {
                ChannelState::WaitingToConnect | ChannelState::Disconnected => {
                    session.state = ChannelState::WaitingToConnect;
                }
                state => {
                    return Err(Error::InvalidState {
                        operation: "wait for connection",
                        state,
                    })
                }
            }
        }

        let (stream, _) = self.listener.accept()?;
        #[cfg(windows)]
        let _ = stream.set_nodelay(true);
        let handle = stream.try_clone()?;

        let mut session = self.session.lock();
        if session.state == ChannelState::Closed {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(Error::InvalidState {
                operation: "accept",
                state: ChannelState::Closed,
            });
        }
        session.state = ChannelState::Connected;
        session.peer = Some(stream);
        debug!(target: "hands_core::transport", channel = %self.name, "Peer connected");

        Ok(handle)
    }

    fn is_connected(&self) -> bool {
        let session = self.session.lock();
        match (&session.state, &session.peer) {
            (ChannelState::Connected, Some(peer)) => probe(peer),
            _ => false,
        }
    }

    fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock();
        match session.state {
            ChannelState::Connected | ChannelState::Broken => {
                Self::shutdown_peer(session.peer.take());
                session.state = ChannelState::Disconnected;
                debug!(target: "hands_core::transport", channel = %self.name, "Peer disconnected");
                Ok(())
            }
            state => Err(Error::InvalidState {
                operation: "disconnect",
                state,
            }),
        }
    }

    fn mark_broken(&self) {
        let mut session = self.session.lock();
        if session.state == ChannelState::Connected {
            session.state = ChannelState::Broken;
        }
    }

    fn close(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.state == ChannelState::Closed {
            return Ok(());
        }
        Self::shutdown_peer(session.peer.take());
        session.state = ChannelState::Closed;

        let path = self.name.endpoint_path();
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "hands_core::transport", path = %path.display(), error = %e, "Failed to remove channel endpoint");
            }
        }
        info!(target: "hands_core::transport", channel = %self.name, "Channel closed");
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Connect to a listening channel.
#[cfg(unix)]
pub fn connect(name: &ChannelName) -> Result<LocalStream> {
    Ok(Stream::connect(name.socket_path())?)
}

#[cfg(windows)]
pub fn connect(name: &ChannelName) -> Result<LocalStream> {
    let content = std::fs::read_to_string(name.port_file())?;
    let port: u16 = content
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("Invalid port file for {}: {:?}", name, content)))?;
    let stream = Stream::connect(("127.0.0.1", port))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Peek without consuming and without blocking. End of file means the
/// peer hung up; pending data or an empty queue both mean it is alive.
#[cfg(unix)]
fn probe(stream: &Stream) -> bool {
    use std::os::unix::io::AsRawFd;

    let mut byte = 0u8;
    let received = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            &mut byte as *mut u8 as *mut libc::c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    match received {
        0 => false,
        n if n > 0 => true,
        _ => matches!(
            std::io::Error::last_os_error().kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
        ),
    }
}

/// Zero-timeout poll; hang-up or error flags mean the peer is gone.
#[cfg(windows)]
fn probe(stream: &Stream) -> bool {
    use std::os::windows::io::AsRawSocket;
    use windows::Win32::Networking::WinSock::{
        WSAPoll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM, SOCKET, WSAPOLLFD,
    };

    let mut fd = WSAPOLLFD {
        fd: SOCKET(stream.as_raw_socket() as usize),
        events: POLLRDNORM,
        revents: Default::default(),
    };
    let ready = unsafe { WSAPoll(&mut fd, 1, 0) };
    if ready < 0 {
        return false;
    }
    fd.revents.0 & (POLLHUP.0 | POLLERR.0 | POLLNVAL.0) == 0
}
