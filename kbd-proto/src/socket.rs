//! Helper for blocking communication over the interposer control socket.

use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use directories::BaseDirs;

use crate::{Event, Reply, Request};

/// Name of the environment variable containing the daemon's socket path.
pub const SOCKET_PATH_ENV: &str = "KBD_INTERPOSER_SOCKET";

/// Directory in which the control socket is placed by default.
pub fn socket_dir() -> PathBuf {
    BaseDirs::new()
        .as_ref()
        .and_then(|x| x.runtime_dir())
        .map(|x| x.to_owned())
        .unwrap_or_else(env::temp_dir)
}

/// Blocking client for the daemon's control socket.
///
/// Handles the socket connection and JSON-lines serialization/
/// deserialization of requests and replies.
pub struct Socket {
    stream: BufReader<UnixStream>,
}

impl Socket {
    /// Connects using the path in [`SOCKET_PATH_ENV`], if set.
    pub fn connect() -> io::Result<Self> {
        let socket_path = env::var_os(SOCKET_PATH_ENV).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{SOCKET_PATH_ENV} is not set, is the daemon running?"),
            )
        })?;
        Self::connect_to(socket_path)
    }

    /// Connects to the control socket at a specific path.
    pub fn connect_to(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path.as_ref())?;
        let stream = BufReader::new(stream);
        Ok(Self { stream })
    }

    /// Sends a request and waits for the matching reply.
    ///
    /// Return values:
    /// * `Ok(Ok(response))`: a successful [`Response`] from the daemon
    /// * `Ok(Err(error))`: an [`EngineError`] reported by the daemon
    /// * `Err(error)`: a transport-level failure talking to the daemon
    pub fn send(&mut self, request: Request) -> io::Result<Reply> {
        let mut buf = serde_json::to_string(&request).expect("Request always serializes");
        buf.push('\n');
        self.stream.get_mut().write_all(buf.as_bytes())?;

        buf.clear();
        self.stream.read_line(&mut buf)?;

        let reply = serde_json::from_str(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(reply)
    }

    /// Switches the connection into reading an [`Event`] stream. Call only
    /// after sending [`Request::EventStream`] and getting back
    /// `Response::Handled`.
    pub fn read_events(self) -> impl FnMut() -> io::Result<Event> {
        let Self { mut stream } = self;

        let mut buf = String::new();
        move || {
            buf.clear();
            stream.read_line(&mut buf)?;
            serde_json::from_str(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }
    }
}
