use std::sync::Arc;

use clap::Parser;
use kbd_config::Config;
use tracing::{info, warn};

use kbd_interposer::cli::Cli;
use kbd_interposer::device::{DeviceBackend, MockBackend};
use kbd_interposer::engine::{Engine, Platform};
use kbd_interposer::guest::{GuestController, ProcessController};
use kbd_interposer::host_tap::{HostTap, MockHostTap};
use kbd_interposer::identity::{IdentitySource, MockIdentitySource};
use kbd_interposer::ipc::IpcServer;
use kbd_interposer::stream::{HidSource, MockHidSource};

fn main() -> anyhow::Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let cli = Cli::parse();

    match &cli.subcommand {
        Some(kbd_interposer::cli::Sub::Msg { msg, json }) => {
            return run_msg_command(msg, *json, cli.socket.as_deref());
        }
        Some(kbd_interposer::cli::Sub::Validate { config }) => {
            return validate_config(config.as_deref());
        }
        None => {}
    }

    let config = match &cli.config {
        Some(path) => Config::load(path).map_err(|report| anyhow::anyhow!("{report:?}"))?,
        None => Config::default(),
    };

    let platform = if cli.mock {
        mock_platform()
    } else {
        real_platform(&config)
    };

    let socket_path = cli.socket.clone().or_else(|| config.socket_path());
    let engine = Arc::new(Engine::new(config, platform));
    let _ipc = IpcServer::start(Arc::clone(&engine), socket_path)?;

    info!("kbd-interposerd started");

    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
        engine.sweep_deadlines();
    }
}

#[cfg(target_os = "macos")]
fn real_platform(config: &Config) -> Platform {
    use kbd_interposer::device::IoHidBackend;
    use kbd_interposer::host_tap::CgEventHostTap;
    use kbd_interposer::identity::IoHidIdentitySource;
    use kbd_interposer::stream::IoHidStreamSource;

    Platform {
        device_backend: Arc::new(IoHidBackend::new()),
        identity_source: Arc::new(IoHidIdentitySource::new()),
        hid_source_factory: Arc::new(|| Arc::new(IoHidStreamSource::new()) as Arc<dyn HidSource>),
        host_tap_factory: Arc::new(|| Arc::new(CgEventHostTap::new()) as Arc<dyn HostTap>),
        guest_controller: Arc::new(ProcessController::new(config.controller_path.clone())),
    }
}

#[cfg(not(target_os = "macos"))]
fn real_platform(config: &Config) -> Platform {
    warn!("non-macOS host: falling back to mock device/tap backends");
    mock_platform_with_controller(config)
}

fn mock_platform() -> Platform {
    mock_platform_with_controller(&Config::default())
}

fn mock_platform_with_controller(config: &Config) -> Platform {
    Platform {
        device_backend: Arc::new(MockBackend::new(Vec::new())) as Arc<dyn DeviceBackend>,
        identity_source: Arc::new(MockIdentitySource::new(Vec::new())) as Arc<dyn IdentitySource>,
        hid_source_factory: Arc::new(|| Arc::new(MockHidSource::new(Vec::new())) as Arc<dyn HidSource>),
        host_tap_factory: Arc::new(|| Arc::new(MockHostTap::new(Vec::new())) as Arc<dyn HostTap>),
        guest_controller: Arc::new(ProcessController::new(config.controller_path.clone())) as Arc<dyn GuestController>,
    }
}

fn run_msg_command(msg: &kbd_interposer::cli::Msg, json: bool, socket: Option<&std::path::Path>) -> anyhow::Result<()> {
    use kbd_interposer::cli::Msg;
    use kbd_proto::{Request, Response, Socket};

    let mut socket = match socket {
        Some(path) => Socket::connect_to(path)?,
        None => Socket::connect()?,
    };

    // Needs a prior round trip (enumerate, then filter by key) to build the
    // `Selection` the daemon expects, so it can't be folded into the
    // one-request-per-variant match below.
    if let Msg::StartSession { device_keys, guest, duration_secs } = msg {
        let devices = match socket.send(Request::EnumerateDevices)? {
            Ok(Response::Devices(devices)) => devices,
            Ok(_) => anyhow::bail!("daemon returned an unexpected response to enumerate-devices"),
            Err(err) => anyhow::bail!("daemon returned an error: {err}"),
        };
        let selected: Vec<_> = devices.into_iter().filter(|d| device_keys.contains(&d.device_key)).collect();
        if selected.len() != device_keys.len() {
            anyhow::bail!("one or more requested device keys were not found among enumerated devices");
        }
        let mode = match guest {
            Some(guest) => kbd_proto::SessionMode::Relay(kbd_proto::GuestId(guest.clone())),
            None => kbd_proto::SessionMode::CaptureOnly,
        };
        let request = Request::StartSession {
            selection: kbd_proto::Selection { devices: selected },
            mode,
            duration: duration_secs.map(std::time::Duration::from_secs),
        };
        return match socket.send(request)? {
            Ok(response) => {
                print_response(response, json);
                Ok(())
            }
            Err(err) => anyhow::bail!("daemon returned an error: {err}"),
        };
    }

    let request = match msg {
        Msg::Devices => Request::EnumerateDevices,
        Msg::DetectIdentity { stop_after } => Request::DetectIdentity { stop_after: *stop_after },
        Msg::Guests => Request::ListGuests,
        Msg::Status { id } => Request::SessionStatus { id: kbd_proto::SessionId(*id) },
        Msg::StopSession { id } => Request::StopSession { id: kbd_proto::SessionId(*id) },
        Msg::CopyKeystrokeLog { id } => Request::CopyKeystrokeLog { id: kbd_proto::SessionId(*id) },
        Msg::StartSession { .. } => unreachable!("handled above"),
    };

    let reply = socket.send(request)?;
    match reply {
        Ok(response) => print_response(response, json),
        Err(err) => anyhow::bail!("daemon returned an error: {err}"),
    }
    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = match path {
        Some(path) => Config::load(path).map_err(|report| anyhow::anyhow!("{report:?}"))?,
        None => Config::default(),
    };
    println!("config OK: {config:?}");
    Ok(())
}

fn print_response(response: kbd_proto::Response, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(&response).expect("Response always serializes"));
    } else {
        println!("{response:?}");
    }
}
