//! QEMU process supervision
//!
//! ```text
//! start(cfg)
//!     └─► compile args  →  tokio::process::Command  →  qemu-system-<arch>
//!             └─► watcher task (owns the Child)
//!                     ├─► stdout / stderr reader tasks  →  output channel
//!                     ├─► control channel (terminate, ping)
//!                     └─► on exit: evict handle, broadcast Exited
//! ```
//!
//! Each VM identity has its own async lock, so start/stop/ping for one VM
//! run one at a time in arrival order while different VMs proceed in
//! parallel. The identity → slot map itself is only held for lookups, and a
//! slot leaves it once its VM is idle and nobody else holds it.

use crate::config::schema::Configuration;
use crate::error::SupervisorError;
use crate::utils::system::pick_qemu_bin;
use crate::vm::args::ArgumentCompiler;
use crate::vm::firmware::{share_dir_for, share_dir_for_prefix};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONTROL_CAPACITY: usize = 8;
const OUTPUT_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Observable lifecycle state of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Idle,
    Starting,
    Running { pid: u32, started_at: DateTime<Utc> },
    Terminating { pid: u32 },
}

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Broadcast to every [`Supervisor::subscribe`] receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Output { id: Uuid, stream: OutputStream, line: String },
    /// The process is gone and the VM is idle again. `code` is `None` when
    /// the process died from a signal.
    Exited { id: Uuid, code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM was sent; the exit arrives later as [`SupervisorEvent::Exited`].
    Signalled,
    AlreadyStopping,
    NotRunning,
}

/// A live process as reported by [`Supervisor::running`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningVm {
    pub id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Exclusive hold on one identity. While it lives nothing can start that VM.
pub struct Reservation {
    _guard: OwnedMutexGuard<SlotState>,
}

enum Control {
    Terminate,
    Ping(oneshot::Sender<bool>),
}

struct OutputLine {
    stream: OutputStream,
    text: String,
}

struct Handle {
    pid: u32,
    generation: u64,
    started_at: DateTime<Utc>,
    control: mpsc::Sender<Control>,
}

enum SlotState {
    Idle,
    Running(Handle),
    Terminating(Handle),
}

impl SlotState {
    fn handle(&self) -> Option<&Handle> {
        match self {
            SlotState::Running(h) | SlotState::Terminating(h) => Some(h),
            SlotState::Idle => None,
        }
    }
}

struct Slot {
    state: Arc<tokio::sync::Mutex<SlotState>>,
    published: watch::Sender<VmState>,
}

type SlotMap = Mutex<HashMap<Uuid, Arc<Slot>>>;

/// Drop the map entry for `id` when `slot` is idle and only the map and the
/// caller hold it. New holders are only handed out under the map lock.
fn evict_idle(slots: &SlotMap, id: Uuid, slot: &Arc<Slot>) {
    let mut map = slots.lock().unwrap_or_else(|e| e.into_inner());
    let Some(current) = map.get(&id) else {
        return;
    };
    if !Arc::ptr_eq(current, slot) || Arc::strong_count(slot) > 2 {
        return;
    }
    let idle = matches!(slot.state.try_lock().as_deref(), Ok(SlotState::Idle));
    if idle {
        map.remove(&id);
    }
}

impl Slot {
    fn new() -> Self {
        let (published, _) = watch::channel(VmState::Idle);
        Slot {
            state: Arc::new(tokio::sync::Mutex::new(SlotState::Idle)),
            published,
        }
    }

    fn publish(&self, state: VmState) {
        self.published.send_replace(state);
    }
}

/// Owns every QEMU child process started through it.
pub struct Supervisor {
    qemu_prefix: Option<PathBuf>,
    slots: Arc<SlotMap>,
    events: broadcast::Sender<SupervisorEvent>,
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(qemu_prefix: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Supervisor {
            qemu_prefix,
            slots: Arc::new(Mutex::new(HashMap::new())),
            events,
            generation: AtomicU64::new(0),
        }
    }

    fn slot(&self, id: Uuid) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(id).or_insert_with(|| Arc::new(Slot::new())).clone()
    }

    fn existing_slot(&self, id: Uuid) -> Option<Arc<Slot>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Start QEMU for a snapshot of `cfg`. Later edits to the configuration
    /// never reach the running process. On error the VM stays idle.
    pub async fn start(&self, cfg: &Configuration, bundle_dir: &Path) -> Result<StartOutcome, SupervisorError> {
        let snapshot = cfg.clone();
        let id = snapshot.id();
        let slot = self.slot(id);
        let mut state = slot.state.lock().await;

        if let Some(handle) = state.handle() {
            if ping(handle).await {
                return Ok(StartOutcome::AlreadyRunning { pid: handle.pid });
            }
            debug!(vm = %snapshot.name(), pid = handle.pid, "dropping stale handle");
            *state = SlotState::Idle;
        }

        slot.publish(VmState::Starting);
        match self.spawn(&snapshot, bundle_dir, &slot) {
            Ok(handle) => {
                let pid = handle.pid;
                slot.publish(VmState::Running {
                    pid,
                    started_at: handle.started_at,
                });
                *state = SlotState::Running(handle);
                Ok(StartOutcome::Started { pid })
            }
            Err(err) => {
                slot.publish(VmState::Idle);
                warn!(vm = %snapshot.name(), error = %err, "VM failed to start");
                drop(state);
                evict_idle(&self.slots, id, &slot);
                Err(err)
            }
        }
    }

    fn spawn(&self, cfg: &Configuration, bundle_dir: &Path, slot: &Arc<Slot>) -> Result<Handle, SupervisorError> {
        let binary = pick_qemu_bin(self.qemu_prefix.as_deref(), cfg.architecture())?;
        let firmware_dir = match &self.qemu_prefix {
            Some(prefix) => share_dir_for_prefix(prefix),
            None => share_dir_for(&binary),
        };
        let args = ArgumentCompiler::new(firmware_dir, bundle_dir).compile(cfg)?;
        debug!(vm = %cfg.name(), binary = %binary.display(), args = ?args, "spawning QEMU");

        let mut child = Command::new(&binary)
            .args(&args)
            .current_dir(bundle_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: binary.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let started_at = Utc::now();
        let name = cfg.name().to_string();
        info!(vm = %name, pid, binary = %binary.display(), "VM spawned");

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, output_tx.clone(), name.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, output_tx, name.clone());
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let watcher = Watcher {
            id: cfg.id(),
            name,
            pid,
            generation,
            slot: slot.clone(),
            slots: self.slots.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(watcher.run(child, control_rx, output_rx));

        Ok(Handle {
            pid,
            generation,
            started_at,
            control: control_tx,
        })
    }

    /// Ask a VM to shut down. Returns without waiting for the exit.
    pub async fn stop(&self, id: Uuid) -> StopOutcome {
        let Some(slot) = self.existing_slot(id) else {
            return StopOutcome::NotRunning;
        };
        let mut state = slot.state.lock().await;
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Idle => StopOutcome::NotRunning,
            SlotState::Terminating(handle) => {
                *state = SlotState::Terminating(handle);
                StopOutcome::AlreadyStopping
            }
            SlotState::Running(handle) => {
                if handle.control.send(Control::Terminate).await.is_err() {
                    // Watcher already saw the exit and is waiting for this lock.
                    slot.publish(VmState::Idle);
                    return StopOutcome::NotRunning;
                }
                debug!(%id, pid = handle.pid, "sent terminate");
                slot.publish(VmState::Terminating { pid: handle.pid });
                *state = SlotState::Terminating(handle);
                StopOutcome::Signalled
            }
        }
    }

    /// Whether a live process exists, checked against the OS. A handle whose
    /// process is gone is evicted on the spot.
    pub async fn is_running(&self, id: Uuid) -> bool {
        let Some(slot) = self.existing_slot(id) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        let Some(handle) = state.handle() else {
            return false;
        };
        if ping(handle).await {
            return true;
        }
        *state = SlotState::Idle;
        slot.publish(VmState::Idle);
        drop(state);
        evict_idle(&self.slots, id, &slot);
        false
    }

    /// Last published state; never waits on the identity lock.
    pub fn status(&self, id: Uuid) -> VmState {
        self.existing_slot(id)
            .map(|slot| slot.published.borrow().clone())
            .unwrap_or(VmState::Idle)
    }

    /// Every VM with a live process, sorted by start time.
    pub fn running(&self) -> Vec<RunningVm> {
        let slots: Vec<(Uuid, Arc<Slot>)> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.iter().map(|(id, slot)| (*id, slot.clone())).collect()
        };
        let mut out: Vec<RunningVm> = slots
            .into_iter()
            .filter_map(|(id, slot)| {
                let state = slot.published.borrow().clone();
                match state {
                    VmState::Running { pid, started_at } => Some(RunningVm { id, pid, started_at }),
                    _ => None,
                }
            })
            .collect();
        out.sort_by_key(|vm| vm.started_at);
        out
    }

    /// Take the identity lock for a destructive operation. Fails with the pid
    /// when a live process exists.
    pub async fn reserve(&self, id: Uuid) -> Result<Reservation, u32> {
        let slot = self.slot(id);
        let mut guard = slot.state.clone().lock_owned().await;
        if let Some(handle) = guard.handle() {
            if ping(handle).await {
                return Err(handle.pid);
            }
            *guard = SlotState::Idle;
            slot.publish(VmState::Idle);
        }
        Ok(Reservation { _guard: guard })
    }

    /// Release the bookkeeping for an identity that is idle, e.g. once its
    /// VM was removed. A VM that is running or busy keeps its slot.
    pub fn forget(&self, id: Uuid) {
        if let Some(slot) = self.existing_slot(id) {
            evict_idle(&self.slots, id, &slot);
        }
    }

    /// Terminate every tracked process and wait (bounded) for their exits.
    pub async fn shutdown(&self) {
        let mut events = self.subscribe();
        let ids: Vec<Uuid> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.keys().copied().collect()
        };

        let mut pending = HashSet::new();
        for id in ids {
            match self.stop(id).await {
                StopOutcome::Signalled | StopOutcome::AlreadyStopping => {
                    pending.insert(id);
                }
                StopOutcome::NotRunning => {}
            }
        }
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "waiting for VMs to exit");

        let wait = async {
            while !pending.is_empty() {
                match events.recv().await {
                    Ok(SupervisorEvent::Exited { id, .. }) => {
                        pending.remove(&id);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        pending.retain(|id| self.status(*id) != VmState::Idle);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, wait).await.is_err() {
            warn!("some VMs did not exit before the shutdown deadline");
        }
    }
}

/// Ask the watcher whether its child is still alive. A watcher that is gone
/// (or going) answers no.
async fn ping(handle: &Handle) -> bool {
    let (tx, rx) = oneshot::channel();
    if handle.control.send(Control::Ping(tx)).await.is_err() {
        return false;
    }
    rx.await.unwrap_or(false)
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>, vm: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(vm = %vm, ?stream, error = %e, "error reading QEMU output");
                    break;
                }
            }
        }
    });
}

struct Watcher {
    id: Uuid,
    name: String,
    pid: u32,
    generation: u64,
    slot: Arc<Slot>,
    slots: Arc<SlotMap>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Watcher {
    async fn run(
        self,
        mut child: Child,
        mut control: mpsc::Receiver<Control>,
        mut output: mpsc::Receiver<OutputLine>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(msg) = control.recv() => match msg {
                    Control::Terminate => self.terminate(&mut child),
                    Control::Ping(reply) => {
                        let alive = matches!(child.try_wait(), Ok(None));
                        let _ = reply.send(alive);
                    }
                },
                Some(line) = output.recv() => self.emit(line),
            }
        };

        // Pending pings now answer "not alive" and no new control arrives.
        drop(control);
        let drain = async {
            while let Some(line) = output.recv().await {
                self.emit(line);
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN, drain).await.is_err() {
            debug!(vm = %self.name, "output still open after exit");
        }

        let code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(vm = %self.name, error = %e, "error waiting for QEMU");
                None
            }
        };

        {
            let mut state = self.slot.state.lock().await;
            if state.handle().map(|h| h.generation) == Some(self.generation) {
                *state = SlotState::Idle;
                self.slot.publish(VmState::Idle);
            }
        }
        evict_idle(&self.slots, self.id, &self.slot);
        info!(vm = %self.name, pid = self.pid, exit_code = ?code, "VM process exited");
        let _ = self.events.send(SupervisorEvent::Exited { id: self.id, code });
    }

    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Ok(pid) = libc::pid_t::try_from(self.pid) {
            // SAFETY: the pid belongs to a child we have not reaped yet.
            if pid > 0 && unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
                return;
            }
        }
        if let Err(e) = child.start_kill() {
            warn!(vm = %self.name, error = %e, "failed to kill QEMU");
        }
    }

    fn emit(&self, line: OutputLine) {
        match line.stream {
            OutputStream::Stdout => info!(vm = %self.name, "{}", line.text),
            OutputStream::Stderr => warn!(vm = %self.name, "{}", line.text),
        }
        let _ = self.events.send(SupervisorEvent::Output {
            id: self.id,
            stream: line.stream,
            line: line.text,
        });
    }
}

#[cfg(test)]
impl Supervisor {
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
