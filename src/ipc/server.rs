use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kbd_proto::{socket_dir, Reply, Request, Response, SOCKET_PATH_ENV};

use crate::engine::Engine;

/// Blocking control-socket server: one accept thread, one handler thread per
/// connected client. No cooperative scheduler is involved — this sits
/// outside the D/E/F hot path the rest of the engine is built around (§5).
pub struct IpcServer {
    /// `None` when the daemon was started without a socket (e.g. some test
    /// harnesses drive the `Engine` directly).
    pub socket_path: Option<PathBuf>,
}

impl IpcServer {
    /// Binds the control socket and spawns the accept loop. `override_path`
    /// takes precedence over [`kbd_proto::SOCKET_PATH_ENV`]'s directory
    /// default, mirroring the teacher compositor's own socket setup.
    pub fn start(engine: Arc<Engine>, override_path: Option<PathBuf>) -> io::Result<Self> {
        let socket_path = override_path.unwrap_or_else(|| {
            let mut path = socket_dir();
            path.push(format!("kbd-interposer.{}.sock", std::process::id()));
            path
        });

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        std::env::set_var(SOCKET_PATH_ENV, &socket_path);
        info!("listening on control socket at {socket_path:?}");

        let accept_path = socket_path.clone();
        std::thread::spawn(move || accept_loop(listener, engine, &accept_path));

        Ok(Self { socket_path: Some(socket_path) })
    }

    /// Starts without binding a socket, for tests that only need an
    /// in-process `Engine`.
    pub fn headless() -> Self {
        Self { socket_path: None }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn accept_loop(listener: UnixListener, engine: Arc<Engine>, socket_path: &Path) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || handle_client(stream, &engine));
            }
            Err(err) => {
                warn!("error accepting IPC client on {socket_path:?}: {err}");
            }
        }
    }
}

fn handle_client(stream: UnixStream, engine: &Engine) {
    trace!("new IPC client connected");
    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!("failed to clone IPC client stream: {err}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut writer = write_stream;

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return, // client disconnected
            Ok(_) => {}
            Err(err) => {
                warn!("error reading IPC request: {err}");
                return;
            }
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(err) => {
                warn!("malformed IPC request: {err}");
                return;
            }
        };

        if matches!(request, Request::EventStream) {
            if write_reply(&mut writer, Ok(Response::Handled)).is_err() {
                return;
            }
            stream_events(engine, &mut writer);
            return;
        }

        let reply = dispatch(engine, request);
        if write_reply(&mut writer, reply).is_err() {
            return;
        }
    }
}

fn dispatch(engine: &Engine, request: Request) -> Reply {
    match request {
        Request::EnumerateDevices => engine.enumerate_devices().map(Response::Devices),
        Request::DetectIdentity { stop_after } => engine.detect_identity(stop_after).map(Response::Selection),
        Request::StartSession { selection, mode, duration } => {
            engine.start_session(selection, mode, duration).map(Response::SessionStarted)
        }
        Request::StopSession { id } => engine.stop_session(id).map(|()| Response::Handled),
        Request::SessionStatus { id } => engine.session_status(id).map(Response::Status),
        Request::CopyKeystrokeLog { id } => engine.copy_keystroke_log(id).map(Response::KeystrokeLog),
        Request::ListGuests => engine.list_guests().map(Response::Guests),
        Request::EventStream => unreachable!("handled by the caller before dispatch"),
    }
}

fn write_reply(writer: &mut UnixStream, reply: Reply) -> io::Result<()> {
    let mut buf = serde_json::to_string(&reply).expect("Reply always serializes");
    buf.push('\n');
    writer.write_all(buf.as_bytes())
}

fn stream_events(engine: &Engine, writer: &mut UnixStream) {
    let rx = engine.subscribe_events();
    while let Ok(event) = rx.recv() {
        let mut buf = serde_json::to_string(&event).expect("Event always serializes");
        buf.push('\n');
        if writer.write_all(buf.as_bytes()).is_err() {
            return;
        }
    }
}
