//! Guest Forwarder (component G): serializes relay intents onto a bounded
//! worker pool, invoking the hypervisor controller CLI with up to
//! `max_in_flight` concurrent subprocesses.

use std::io;
use std::process::Command;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use kbd_proto::{EngineError, Event, Guest, GuestId, GuestStatus, RelayDirection, RelayIntent};

use crate::events::EventBus;

/// Invokes the hypervisor controller CLI. The real implementation shells
/// out; tests substitute a recording/scripted stand-in.
pub trait GuestController: Send + Sync {
    fn send_key_event(&self, target: &GuestId, scan_code: i32, direction: RelayDirection) -> io::Result<ControllerOutcome>;
    fn list_guests(&self) -> io::Result<ControllerOutcome>;
}

/// Raw process-exit view of a controller invocation, kept decoupled from
/// `std::process::Output` so tests can fabricate one without a subprocess.
pub struct ControllerOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Shells out to the hypervisor controller named in configuration, per the
/// wire contract in §6 (`send-key-event <uuid> --scancode <N> --event
/// press|release`, `list --all`).
pub struct ProcessController {
    controller_path: String,
}

impl ProcessController {
    pub fn new(controller_path: String) -> Self {
        Self { controller_path }
    }

    fn run(&self, args: &[&str]) -> io::Result<ControllerOutcome> {
        let output = Command::new(&self.controller_path).args(args).output()?;
        Ok(ControllerOutcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl GuestController for ProcessController {
    fn send_key_event(&self, target: &GuestId, scan_code: i32, direction: RelayDirection) -> io::Result<ControllerOutcome> {
        let event = match direction {
            RelayDirection::Press => "press",
            RelayDirection::Release => "release",
        };
        self.run(&[
            "send-key-event",
            &target.0,
            "--scancode",
            &scan_code.to_string(),
            "--event",
            event,
        ])
    }

    fn list_guests(&self) -> io::Result<ControllerOutcome> {
        self.run(&["list", "--all"])
    }
}

/// Parses `list --all` output per §4.G: whitespace-separated `uuid status
/// name` records, one per line; the header (starting with `UUID`) and blank
/// lines are skipped.
pub fn parse_guest_list(stdout: &str) -> Vec<Guest> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with("UUID"))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let uuid = parts.next()?;
            let status = parts.next()?;
            let name = parts.collect::<Vec<_>>().join(" ");
            Some(Guest {
                id: GuestId(uuid.to_owned()),
                status: parse_guest_status(status),
                name,
            })
        })
        .collect()
}

fn parse_guest_status(raw: &str) -> GuestStatus {
    match raw.to_ascii_lowercase().as_str() {
        "running" => GuestStatus::Running,
        "stopped" => GuestStatus::Stopped,
        "suspended" => GuestStatus::Suspended,
        _ => GuestStatus::Unknown,
    }
}

/// Bounded worker pool for component G: up to `max_in_flight` OS threads,
/// each pulling `RelayIntent`s off one shared queue and blocking on the
/// controller subprocess's `wait` (§5's one named suspension point besides
/// the janitor's sleep).
pub struct GuestForwarder {
    tx: SyncSender<RelayIntent>,
    workers: Vec<JoinHandle<()>>,
}

impl GuestForwarder {
    /// Spawns `max_in_flight` worker threads against `controller`. Failed
    /// invocations are logged with scan code, guest id, and stderr and are
    /// never retried (§4.G / §7 `GuestInvocationFailed`: "the key event is
    /// considered lost").
    pub fn spawn(controller: Arc<dyn GuestController>, max_in_flight: usize, event_bus: Arc<EventBus>) -> Self {
        let (tx, rx) = sync_channel::<RelayIntent>(max_in_flight.max(1) * 4);
        let rx = Arc::new(std::sync::Mutex::new(rx));

        let workers = (0..max_in_flight.max(1))
            .map(|_| {
                let controller = Arc::clone(&controller);
                let rx = Arc::clone(&rx);
                let event_bus = Arc::clone(&event_bus);
                std::thread::spawn(move || worker_loop(&rx, controller.as_ref(), event_bus.as_ref()))
            })
            .collect();

        Self { tx, workers }
    }

    /// Enqueues a relay intent. Non-blocking: a full queue means the
    /// session is falling behind bursty typing and the caller (Device
    /// Stream) drops the intent rather than stalling the HID thread.
    pub fn enqueue(&self, intent: RelayIntent) -> Result<(), RelayIntent> {
        self.tx.try_send(intent).map_err(|e| match e {
            std::sync::mpsc::TrySendError::Full(intent) => intent,
            std::sync::mpsc::TrySendError::Disconnected(intent) => intent,
        })
    }

    pub fn sender(&self) -> SyncSender<RelayIntent> {
        self.tx.clone()
    }

    /// Stops accepting new work and waits for outstanding jobs to finish
    /// (§5: "Outstanding G jobs are allowed to complete (no cancellation)").
    pub fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: &std::sync::Mutex<Receiver<RelayIntent>>, controller: &dyn GuestController, event_bus: &EventBus) {
    loop {
        let intent = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let Ok(intent) = intent else { break };

        match controller.send_key_event(&intent.target, intent.scan_code, intent.direction) {
            Ok(outcome) if outcome.success => {
                event_bus.publish(Event::RelaySucceeded(intent));
            }
            Ok(outcome) => {
                let error = EngineError::GuestInvocationFailed {
                    scan_code: intent.scan_code,
                    guest: intent.target.clone(),
                    stderr: outcome.stderr,
                };
                warn!("{error}");
                event_bus.publish(Event::RelayFailed { intent, error });
            }
            Err(io_err) => {
                let error = EngineError::GuestInvocationFailed {
                    scan_code: intent.scan_code,
                    guest: intent.target.clone(),
                    stderr: io_err.to_string(),
                };
                warn!(
                    "failed to invoke hypervisor controller for scan code {} on {}: {io_err}",
                    intent.scan_code, intent.target
                );
                event_bus.publish(Event::RelayFailed { intent, error });
            }
        }
    }
}

/// `list_guests()` against a live controller (§4.G).
pub fn list_guests(controller: &dyn GuestController) -> Result<Vec<Guest>, EngineError> {
    let outcome = controller
        .list_guests()
        .map_err(|e| EngineError::SubsystemUnavailable(format!("failed to run guest list command: {e}")))?;
    if !outcome.success {
        return Err(EngineError::SubsystemUnavailable(format!(
            "guest list command exited with failure: {}",
            outcome.stderr
        )));
    }
    Ok(parse_guest_list(&outcome.stdout))
}
