//! Types for communicating with the keyboard interposer daemon.
//!
//! This is the operator control surface named in the engine design: a small
//! set of request/response/event types plus a blocking socket helper, in the
//! same spirit as the teacher compositor's own IPC crate.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod socket;

pub use socket::{socket_dir, Socket, SOCKET_PATH_ENV};

/// How a physical keyboard interface reaches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Usb,
    Bluetooth,
    BuiltIn,
    Unknown,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Usb => "USB",
            Transport::Bluetooth => "Bluetooth",
            Transport::BuiltIn => "Built-in",
            Transport::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One physical interface of one keyboard, as produced by the Device
/// Enumerator (component A).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// `vendor:product:location`, lowercase hex, 4/4/8 digits wide.
    pub device_key: String,
    /// `vendor-product-(location>>8)`, collapses transport interfaces of one
    /// physical keyboard into a single identity.
    pub physical_id: String,
    pub name: String,
    pub manufacturer: String,
    pub transport: Transport,
    pub vendor_id: u32,
    pub product_id: u32,
}

/// The set of `Device`s the engine treats as one physical keyboard target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub devices: Vec<Device>,
}

impl Selection {
    pub fn device_keys(&self) -> HashSet<String> {
        self.devices.iter().map(|d| d.device_key.clone()).collect()
    }

    pub fn physical_id(&self) -> Option<&str> {
        self.devices.first().map(|d| d.physical_id.as_str())
    }
}

/// Identifier for a hypervisor-managed guest, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestId(pub String);

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a session only blocks host delivery, or also relays to a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    CaptureOnly,
    Relay(GuestId),
}

/// Opaque handle identifying a running session, returned by `StartSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Read-only snapshot of a session, published on demand (Design Notes §9).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub active: bool,
    pub events_captured: u64,
    pub time_remaining: Option<Duration>,
}

/// Key press/release direction, shared by `Keystroke` and `HostEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Down,
    Up,
}

/// A transition derived from a device's raw HID state reports (component D).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystroke {
    pub key_code: i32,
    pub direction: Direction,
    pub at_millis: u64,
    pub source_device_key: String,
}

/// A key event observed through the host's system-wide dispatch path
/// (component E). The host API does not expose the source device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
    pub key_code: i32,
    pub direction: Direction,
    pub at_millis: u64,
}

/// Press/release direction as expected by the hypervisor controller CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayDirection {
    Press,
    Release,
}

/// An intent to forward one key transition to a guest (component F output,
/// component G input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayIntent {
    pub scan_code: i32,
    pub direction: RelayDirection,
    pub target: GuestId,
}

/// Status of a hypervisor-managed guest, from `vmctl list --all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestStatus {
    Running,
    Stopped,
    Suspended,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: GuestId,
    pub status: GuestStatus,
    pub name: String,
}

/// The error taxonomy from the engine's error handling design (§7),
/// serializable so it can cross the socket as `Response::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    PermissionDenied(String),
    SubsystemUnavailable(String),
    NoMatch,
    DeviceVanished { device_key: String },
    GuestInvocationFailed { scan_code: i32, guest: GuestId, stderr: String },
    StaleCorrelation { key_code: i32 },
    MappingMiss { what: String, value: i32 },
    SessionNotFound(SessionId),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::PermissionDenied(what) => write!(f, "permission denied: {what}"),
            EngineError::SubsystemUnavailable(what) => write!(f, "subsystem unavailable: {what}"),
            EngineError::NoMatch => write!(f, "identity detection observed no matching device"),
            EngineError::DeviceVanished { device_key } => {
                write!(f, "device {device_key} vanished mid-session")
            }
            EngineError::GuestInvocationFailed { scan_code, guest, stderr } => write!(
                f,
                "guest invocation failed for scan code {scan_code} on {guest}: {stderr}"
            ),
            EngineError::StaleCorrelation { key_code } => {
                write!(f, "stale correlation entry for key {key_code}")
            }
            EngineError::MappingMiss { what, value } => {
                write!(f, "no mapping for {what} {value}")
            }
            EngineError::SessionNotFound(id) => write!(f, "no session with id {}", id.0),
        }
    }
}

impl std::error::Error for EngineError {}

/// Domain events posted to an unbounded channel for UI consumption
/// (Design Notes §9). Never gated on a listener being present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    KeystrokeCaptured(Keystroke),
    RelaySucceeded(RelayIntent),
    RelayFailed { intent: RelayIntent, error: EngineError },
    StateTransitioned { session: SessionId, state: &'static str },
}

/// A request sent to the daemon over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    EnumerateDevices,
    DetectIdentity { stop_after: u32 },
    StartSession { selection: Selection, mode: SessionMode, duration: Option<Duration> },
    StopSession { id: SessionId },
    SessionStatus { id: SessionId },
    CopyKeystrokeLog { id: SessionId },
    ListGuests,
    /// Switches the connection into a one-way `Event` feed.
    EventStream,
}

/// The daemon's reply to a `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Devices(Vec<Device>),
    Selection(Selection),
    SessionStarted(SessionId),
    Handled,
    Status(SessionStatus),
    KeystrokeLog(Vec<Keystroke>),
    Guests(Vec<Guest>),
}

/// `Ok(Response)` on success, or an [`EngineError`] reported by the daemon.
pub type Reply = Result<Response, EngineError>;
