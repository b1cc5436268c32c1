//! The model-runner scheduler.
//!
//! One scheduling task owns all mutable state: the table of loaded runners,
//! the by-key index, the VRAM ledger, the parked-request queue, and the
//! expiry heap. Everything else — HTTP handlers, spawn health pollers, stop
//! helpers, exit monitors — talks to it over channels, so no lock is ever
//! held across a spawn or a stop:
//!
//! - a bounded `pending` channel carries new load requests; overflow is a
//!   `QueueFull` rejection,
//! - an unbounded `events` channel carries everything else (spawn results,
//!   lease releases, runner exits, stop completions, commands),
//! - the select loop also waits on the nearest expiry deadline and, once a
//!   shutdown is in flight, its deadline.
//!
//! Leases hold only ids and channel ends, never the scheduler itself, so
//! `Lease → Scheduler` never forms an ownership cycle.

pub mod ledger;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::discover::{DeviceDescriptor, DeviceDiscovery, DeviceId, GpuSnapshot, LibraryTag};
use crate::error::{KilnError, Result};
use crate::estimate::{self, GpuBudget, MemoryEstimate};
use crate::model::store::ResolvedModel;
use crate::model::{Capability, ModelKey, ModelMetadata, OptionsKey, RunnerOptions};
use crate::runner::spawner::{RunnerHandle, RunnerSpawner, SpawnSpec};
use crate::runner::{KeepAlive, RunnerState, RunnerStatus};
use crate::settings::Settings;
use ledger::DeviceLedger;

pub type RunnerId = u64;

/// Scheduler tunables, resolved from [`Settings`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global cap on loaded runners. 0 = unlimited.
    pub max_runners: usize,
    /// Bound on queued requests (waiting lines included). 0 = unlimited.
    pub max_queue: usize,
    /// Default per-runner concurrency permits.
    pub default_parallel: u32,
    /// Default session duration.
    pub default_keep_alive: KeepAlive,
    /// Max time for a runner to become healthy.
    pub load_timeout: Duration,
    /// Bound on the shutdown drain; each runner gets half of it as its
    /// SIGTERM grace.
    pub shutdown_grace: Duration,
    /// Spread layers across all GPUs instead of filling in order.
    pub sched_spread: bool,
    /// Per-GPU VRAM reserved from scheduling.
    pub gpu_overhead: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_runners: 0,
            max_queue: 512,
            default_parallel: 1,
            default_keep_alive: KeepAlive::For(Duration::from_secs(300)),
            load_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            sched_spread: false,
            gpu_overhead: 0,
        }
    }
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_runners: settings.max_runners,
            max_queue: settings.max_queue,
            default_parallel: settings.num_parallel,
            default_keep_alive: settings.keep_alive(),
            load_timeout: settings.load_timeout(),
            shutdown_grace: settings.shutdown_timeout(),
            sched_spread: settings.sched_spread,
            gpu_overhead: settings.gpu_overhead,
        }
    }
}

/// A granted slot on a running runner.
///
/// Holds one ref-count slot until released (dropping releases as a safety
/// net) and can take a parallelism permit for the duration of a call. If the
/// runner dies mid-session the permit semaphore closes and
/// [`Lease::with_permit`] fails with `RunnerDied`.
pub struct Lease {
    runner: RunnerId,
    port: u16,
    model_key: ModelKey,
    permits: Arc<Semaphore>,
    death: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SchedEvent>,
    released: bool,
}

impl Lease {
    pub fn runner_id(&self) -> RunnerId {
        self.runner
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn model_key(&self) -> &ModelKey {
        &self.model_key
    }

    /// Whether the runner has exited under us.
    pub fn is_dead(&self) -> bool {
        *self.death.borrow()
    }

    /// Take a parallelism permit, waiting if the runner is saturated.
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KilnError::RunnerDied)
    }

    /// Run one runner call under a parallelism permit.
    pub async fn with_permit<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let _permit = self.acquire_permit().await?;
        fut.await
    }

    /// Release the lease, returning the ref-count slot to the scheduler.
    pub fn release(mut self) {
        self.send_release();
    }

    fn send_release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.events.send(SchedEvent::Released { runner: self.runner });
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.send_release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("runner", &self.runner)
            .field("port", &self.port)
            .field("model_key", &self.model_key)
            .finish()
    }
}

/// What a handler submits to get a runner.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model: ResolvedModel,
    pub options: RunnerOptions,
    pub keep_alive: KeepAlive,
}

struct PendingRequest {
    req: LoadRequest,
    options_key: OptionsKey,
    reply: oneshot::Sender<Result<Lease>>,
    enqueued_at: Instant,
    refreshed: bool,
}

enum SchedEvent {
    SpawnFinished {
        runner: RunnerId,
        result: std::result::Result<Arc<dyn RunnerHandle>, crate::runner::spawner::SpawnError>,
    },
    Released {
        runner: RunnerId,
    },
    RunnerExited {
        runner: RunnerId,
        code: Option<i32>,
    },
    Stopped {
        runner: RunnerId,
    },
    Expire {
        model_key: ModelKey,
    },
    Ps {
        reply: oneshot::Sender<Vec<RunnerStatus>>,
    },
    Reservations {
        reply: oneshot::Sender<Vec<(DeviceId, u64)>>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the scheduling task.
#[derive(Clone)]
pub struct Scheduler {
    cfg: Arc<SchedulerConfig>,
    pending_tx: mpsc::Sender<PendingRequest>,
    events_tx: mpsc::UnboundedSender<SchedEvent>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        discovery: Arc<dyn DeviceDiscovery>,
        spawner: Arc<dyn RunnerSpawner>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let (pending_tx, pending_rx) = mpsc::channel(cfg.max_queue.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let snapshot = discovery.snapshot();
        for dev in snapshot.gpus() {
            tracing::info!(
                "Device {} ({}, {}): {}MiB free / {}MiB total",
                dev.id,
                dev.library,
                dev.name,
                dev.free_vram / (1024 * 1024),
                dev.total_vram / (1024 * 1024),
            );
        }
        for unsupported in snapshot.unsupported() {
            tracing::info!(
                "Device {} not schedulable: {}",
                unsupported.device.id,
                unsupported.reason
            );
        }

        let core = SchedulerCore {
            cfg: cfg.clone(),
            discovery,
            spawner,
            ledger: DeviceLedger::from_snapshot(&snapshot),
            snapshot,
            loaded: HashMap::new(),
            by_key: HashMap::new(),
            parked: VecDeque::new(),
            expiry: BinaryHeap::new(),
            next_id: 1,
            next_gen: 1,
            events_tx: events_tx.clone(),
            shutdown: None,
            shutdown_done: false,
        };
        tokio::spawn(core.run(pending_rx, events_rx));

        Self { cfg, pending_tx, events_tx }
    }

    /// Get a lease on a runner for the model, loading one if necessary.
    ///
    /// Blocks until a runner is ready or the request fails; dropping the
    /// returned future withdraws the request.
    pub async fn get_runner(
        &self,
        model: ResolvedModel,
        mut options: RunnerOptions,
        required: &[Capability],
        keep_alive: Option<KeepAlive>,
    ) -> Result<Lease> {
        for cap in required {
            if !model.metadata.has_capability(*cap) {
                return Err(KilnError::CapabilityMissing(*cap));
            }
        }

        if options.num_parallel == 0 {
            options.num_parallel = self.cfg.default_parallel.max(1);
        }
        let options_key = OptionsKey::of(&options);
        let req = LoadRequest {
            model,
            options,
            keep_alive: keep_alive.unwrap_or(self.cfg.default_keep_alive),
        };

        let (reply, rx) = oneshot::channel();
        let pending = PendingRequest {
            req,
            options_key,
            reply,
            enqueued_at: Instant::now(),
            refreshed: false,
        };
        self.pending_tx.try_send(pending).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => KilnError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => KilnError::ShuttingDown,
        })?;

        rx.await.map_err(|_| KilnError::ShuttingDown)?
    }

    /// Mark every runner for the model as draining; each unloads as soon as
    /// its last lease is released. Safe and idempotent when nothing matches.
    pub fn expire_runner(&self, model_key: &ModelKey) {
        let _ = self.events_tx.send(SchedEvent::Expire {
            model_key: model_key.clone(),
        });
    }

    /// Snapshot of loaded runners.
    pub async fn ps(&self) -> Vec<RunnerStatus> {
        let (reply, rx) = oneshot::channel();
        if self.events_tx.send(SchedEvent::Ps { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current VRAM reservations per device.
    pub async fn device_reservations(&self) -> Vec<(DeviceId, u64)> {
        let (reply, rx) = oneshot::channel();
        if self.events_tx.send(SchedEvent::Reservations { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Drain and unload everything. New requests fail with `ShuttingDown`
    /// immediately; returns once all runners unloaded or the grace elapsed.
    pub async fn shutdown(&self, grace: Duration) {
        let (reply, rx) = oneshot::channel();
        if self.events_tx.send(SchedEvent::Shutdown { grace, reply }).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

#[derive(PartialEq, Eq)]
struct ExpiryEntry {
    at: Instant,
    gen: u64,
    runner: RunnerId,
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.gen, self.runner).cmp(&(other.at, other.gen, other.runner))
    }
}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct RunnerSlot {
    id: RunnerId,
    state: RunnerState,
    spec: SpawnSpec,
    metadata: ModelMetadata,
    keep_alive: KeepAlive,
    ref_count: usize,
    expires_at: Option<Instant>,
    expiry_gen: u64,
    permits: Arc<Semaphore>,
    death_tx: watch::Sender<bool>,
    handle: Option<Arc<dyn RunnerHandle>>,
    waiters: Vec<PendingRequest>,
    respawned: bool,
    stopping: bool,
}

struct ShutdownState {
    deadline: Instant,
    replies: Vec<oneshot::Sender<()>>,
}

enum Admit {
    Done,
    Parked(PendingRequest),
}

struct SchedulerCore {
    cfg: Arc<SchedulerConfig>,
    discovery: Arc<dyn DeviceDiscovery>,
    spawner: Arc<dyn RunnerSpawner>,
    snapshot: GpuSnapshot,
    ledger: DeviceLedger,
    loaded: HashMap<RunnerId, RunnerSlot>,
    by_key: HashMap<(ModelKey, OptionsKey), RunnerId>,
    parked: VecDeque<PendingRequest>,
    expiry: BinaryHeap<Reverse<ExpiryEntry>>,
    next_id: RunnerId,
    next_gen: u64,
    events_tx: mpsc::UnboundedSender<SchedEvent>,
    shutdown: Option<ShutdownState>,
    shutdown_done: bool,
}

impl SchedulerCore {
    async fn run(
        mut self,
        mut pending_rx: mpsc::Receiver<PendingRequest>,
        mut events_rx: mpsc::UnboundedReceiver<SchedEvent>,
    ) {
        loop {
            let next_expiry = self.expiry.peek().map(|Reverse(e)| e.at);
            let shutdown_deadline = self.shutdown.as_ref().map(|s| s.deadline);

            tokio::select! {
                biased;
                Some(event) = events_rx.recv() => self.handle_event(event),
                Some(req) = pending_rx.recv() => self.handle_request(req),
                _ = tokio::time::sleep_until(next_expiry.unwrap_or_else(Instant::now)),
                    if next_expiry.is_some() => self.fire_expiry(),
                _ = tokio::time::sleep_until(shutdown_deadline.unwrap_or_else(Instant::now)),
                    if shutdown_deadline.is_some() => self.finish_shutdown(),
                else => break,
            }

            self.pump();
            if self.shutdown_done {
                break;
            }
        }
        tracing::debug!("Scheduler core exited");
    }

    fn handle_event(&mut self, event: SchedEvent) {
        match event {
            SchedEvent::SpawnFinished { runner, result } => self.on_spawn_finished(runner, result),
            SchedEvent::Released { runner } => self.on_released(runner),
            SchedEvent::RunnerExited { runner, code } => self.on_runner_exited(runner, code),
            SchedEvent::Stopped { runner } => self.on_stopped(runner),
            SchedEvent::Expire { model_key } => self.on_expire(&model_key),
            SchedEvent::Ps { reply } => {
                let _ = reply.send(self.status_rows());
            }
            SchedEvent::Reservations { reply } => {
                let rows = self
                    .snapshot
                    .gpus()
                    .map(|d| (d.id.clone(), self.ledger.reserved(&d.id)))
                    .collect();
                let _ = reply.send(rows);
            }
            SchedEvent::Shutdown { grace, reply } => self.begin_shutdown(grace, reply),
        }
    }

    // ── admission ────────────────────────────────────────────────────

    fn handle_request(&mut self, req: PendingRequest) {
        if req.reply.is_closed() {
            return;
        }
        if self.shutdown.is_some() {
            let _ = req.reply.send(Err(KilnError::ShuttingDown));
            return;
        }
        if self.cfg.max_queue > 0 && self.queued_total() >= self.cfg.max_queue {
            let _ = req.reply.send(Err(KilnError::QueueFull));
            return;
        }

        // preserve FIFO within a waiting line: never jump a parked request
        // for the same (model, options)
        let key = (req.req.model.key.clone(), req.options_key.clone());
        if self.parked.iter().any(|p| {
            p.req.model.key == key.0 && p.options_key == key.1
        }) {
            self.parked.push_back(req);
            return;
        }

        match self.try_admit(req) {
            Admit::Done => {}
            Admit::Parked(req) => self.parked.push_back(req),
        }
    }

    fn try_admit(&mut self, req: PendingRequest) -> Admit {
        if req.reply.is_closed() {
            return Admit::Done;
        }
        if self.shutdown.is_some() {
            let _ = req.reply.send(Err(KilnError::ShuttingDown));
            return Admit::Done;
        }

        let key = (req.req.model.key.clone(), req.options_key.clone());
        if let Some(&id) = self.by_key.get(&key) {
            let slot = self.loaded.get_mut(&id).expect("by_key points at loaded");
            match slot.state {
                RunnerState::Loading => {
                    // queue behind the load; the lease is handed out on Ready
                    slot.keep_alive = req.req.keep_alive;
                    slot.waiters.push(req);
                    return Admit::Done;
                }
                RunnerState::Ready if !slot.stopping => {
                    self.grant(id, req);
                    return Admit::Done;
                }
                // draining runners accept no new leases; wait for the
                // unload, then load afresh
                _ => return Admit::Parked(req),
            }
        }

        self.try_place(req)
    }

    fn try_place(&mut self, mut req: PendingRequest) -> Admit {
        loop {
            if self.cfg.max_runners > 0 && self.active_count() >= self.cfg.max_runners {
                self.evict_one_idle();
                return Admit::Parked(req);
            }

            let (est, devices) = self.plan(&req.req.model.metadata, &req.req.options);
            let cpu_ok = est.cpu_bytes <= self.cpu_free();

            if est.fully_loaded && cpu_ok {
                self.spawn_runner(req, est, devices);
                return Admit::Done;
            }

            // Partial or empty fit: idle runners are worth more unloaded.
            // Evict one and wait; each unload re-runs placement with a
            // bigger budget.
            if self.has_idle_victim() {
                self.evict_one_idle();
                return Admit::Parked(req);
            }
            if self.has_draining() {
                return Admit::Parked(req);
            }

            if est.layers_offloaded > 0 && cpu_ok {
                self.spawn_runner(req, est, devices);
                return Admit::Done;
            }
            if cpu_ok {
                // CPU-only placement
                let est = estimate::cpu_only(&req.req.model.metadata, &req.req.options);
                self.spawn_runner(req, est, Vec::new());
                return Admit::Done;
            }

            // the snapshot may be stale; refresh once before giving up
            if !req.refreshed {
                req.refreshed = true;
                self.refresh_snapshot();
                continue;
            }
            tracing::warn!(
                "No feasible device for {} (model_key={})",
                req.req.model.name,
                req.req.model.key.short()
            );
            let _ = req.reply.send(Err(KilnError::NoFeasibleDevice));
            return Admit::Done;
        }
    }

    /// Pick a device set and placement for the request against current
    /// budgets. Runners never span backend libraries, so the library with
    /// the most schedulable VRAM wins.
    fn plan(
        &self,
        metadata: &ModelMetadata,
        options: &RunnerOptions,
    ) -> (MemoryEstimate, Vec<DeviceDescriptor>) {
        let mask = options.visible_devices.as_deref();
        let eligible: Vec<&DeviceDescriptor> = self
            .snapshot
            .gpus()
            .filter(|d| match mask {
                Some(mask) => mask.iter().any(|m| m == d.id.as_str()),
                None => true,
            })
            .collect();

        let mut totals: HashMap<LibraryTag, u64> = HashMap::new();
        for dev in &eligible {
            *totals.entry(dev.library).or_default() +=
                self.ledger.budget(dev, self.cfg.gpu_overhead);
        }
        let library_rank = |lib: LibraryTag| match lib {
            LibraryTag::Cuda => 0,
            LibraryTag::Rocm => 1,
            LibraryTag::OneApi => 2,
            LibraryTag::Metal => 3,
            LibraryTag::Cpu => 4,
        };
        let Some(library) = totals
            .iter()
            .max_by_key(|(lib, total)| (**total, Reverse(library_rank(**lib))))
            .map(|(lib, _)| *lib)
        else {
            return (estimate::cpu_only(metadata, options), Vec::new());
        };

        let chosen: Vec<&DeviceDescriptor> = eligible
            .into_iter()
            .filter(|d| d.library == library)
            .collect();
        let budgets: Vec<GpuBudget> = chosen
            .iter()
            .map(|d| GpuBudget {
                id: d.id.clone(),
                library: d.library,
                available: self.ledger.budget(d, self.cfg.gpu_overhead),
            })
            .collect();

        let est = estimate::fit(metadata, options, &budgets, self.cfg.sched_spread);
        let devices = est
            .gpus
            .iter()
            .filter_map(|id| chosen.iter().find(|d| &d.id == id).map(|d| (*d).clone()))
            .collect();
        (est, devices)
    }

    fn spawn_runner(&mut self, req: PendingRequest, est: MemoryEstimate, devices: Vec<DeviceDescriptor>) {
        let id = self.next_id;
        self.next_id += 1;

        for (dev, bytes) in est.gpus.iter().zip(&est.vram_per_gpu) {
            self.ledger.reserve(dev, *bytes);
        }

        let spec = SpawnSpec {
            model_name: req.req.model.name.clone(),
            model_key: req.req.model.key.clone(),
            options_key: req.options_key.clone(),
            weights_path: req.req.model.weights_path.clone(),
            options: req.req.options.clone(),
            estimate: est,
            devices,
        };
        tracing::info!(
            "Loading {} (model_key={}, {})",
            spec.model_name,
            spec.model_key.short(),
            spec.estimate.summary()
        );

        let (death_tx, _) = watch::channel(false);
        let slot = RunnerSlot {
            id,
            state: RunnerState::Loading,
            metadata: req.req.model.metadata.clone(),
            keep_alive: req.req.keep_alive,
            ref_count: 0,
            expires_at: None,
            expiry_gen: 0,
            permits: Arc::new(Semaphore::new(spec.options.num_parallel.max(1) as usize)),
            death_tx,
            handle: None,
            waiters: vec![req],
            respawned: false,
            stopping: false,
            spec,
        };
        self.by_key.insert(
            (slot.spec.model_key.clone(), slot.spec.options_key.clone()),
            id,
        );
        self.loaded.insert(id, slot);
        self.spawn_task(id);
    }

    fn spawn_task(&self, id: RunnerId) {
        let slot = &self.loaded[&id];
        let spawner = self.spawner.clone();
        let spec = slot.spec.clone();
        let load_timeout = self.cfg.load_timeout;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match spawner.spawn(&spec).await {
                Ok(handle) => match handle.wait_healthy(load_timeout).await {
                    Ok(()) => Ok(handle),
                    Err(e) => {
                        handle.stop(Duration::from_secs(5)).await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            let _ = events.send(SchedEvent::SpawnFinished { runner: id, result });
        });
    }

    fn grant(&mut self, id: RunnerId, req: PendingRequest) {
        let events = self.events_tx.clone();
        let slot = self.loaded.get_mut(&id).expect("granting on a live runner");
        slot.ref_count += 1;
        slot.expires_at = None;
        slot.keep_alive = req.req.keep_alive;

        let lease = Lease {
            runner: id,
            port: slot.handle.as_ref().map(|h| h.port()).unwrap_or_default(),
            model_key: slot.spec.model_key.clone(),
            permits: slot.permits.clone(),
            death: slot.death_tx.subscribe(),
            events,
            released: false,
        };
        if req.reply.send(Ok(lease)).is_err() {
            // Caller canceled while we granted: the lease was dropped on
            // the floor and its Drop already posted the release.
            tracing::debug!("Request canceled at grant time (runner {})", id);
        }
    }

    // ── spawn results ────────────────────────────────────────────────

    fn on_spawn_finished(
        &mut self,
        id: RunnerId,
        result: std::result::Result<Arc<dyn RunnerHandle>, crate::runner::spawner::SpawnError>,
    ) {
        match result {
            Ok(handle) => self.on_spawn_ok(id, handle),
            Err(e) => self.on_spawn_err(id, e),
        }
    }

    fn on_spawn_ok(&mut self, id: RunnerId, handle: Arc<dyn RunnerHandle>) {
        let Some(slot) = self.loaded.get_mut(&id) else { return };
        slot.handle = Some(handle.clone());

        if slot.state == RunnerState::Draining {
            // expired or shut down while still loading
            let shutting_down = self.shutdown.is_some();
            for waiter in slot.waiters.drain(..) {
                let error = if shutting_down {
                    KilnError::ShuttingDown
                } else {
                    KilnError::RunnerDied
                };
                let _ = waiter.reply.send(Err(error));
            }
            self.stop_runner(id);
            return;
        }

        slot.state = RunnerState::Ready;
        tracing::info!(
            "Runner for {} ready (port={}, pid={:?})",
            slot.spec.model_name,
            handle.port(),
            handle.pid()
        );

        // watch for the process dying out from under us
        let events = self.events_tx.clone();
        let monitor = handle.clone();
        tokio::spawn(async move {
            let code = monitor.wait_exit().await;
            let _ = events.send(SchedEvent::RunnerExited { runner: id, code });
        });

        let waiters = std::mem::take(&mut self.loaded.get_mut(&id).unwrap().waiters);
        for waiter in waiters {
            if waiter.reply.is_closed() {
                continue;
            }
            self.grant(id, waiter);
        }
        let slot = self.loaded.get_mut(&id).unwrap();
        if slot.ref_count == 0 {
            // every waiter canceled while we were loading
            let keep_alive = slot.keep_alive;
            self.schedule_expiry(id, keep_alive);
        }

        self.refresh_snapshot();
    }

    fn on_spawn_err(&mut self, id: RunnerId, error: crate::runner::spawner::SpawnError) {
        let Some(slot) = self.loaded.get_mut(&id) else { return };

        let layers = slot.spec.estimate.layers_offloaded;
        if error.is_oom() && !slot.respawned && layers > 0 && slot.state == RunnerState::Loading {
            let cap = layers / 2;
            tracing::warn!(
                "Runner for {} hit OOM at {} layers, retrying with {}",
                slot.spec.model_name,
                layers,
                cap
            );
            release_slot_vram(&mut self.ledger, slot);
            slot.spec.options.num_gpu_layers = Some(cap);
            slot.respawned = true;

            let metadata = slot.metadata.clone();
            let options = slot.spec.options.clone();
            let (est, devices) = if cap == 0 {
                (estimate::cpu_only(&metadata, &options), Vec::new())
            } else {
                self.plan(&metadata, &options)
            };
            let slot = self.loaded.get_mut(&id).unwrap();
            slot.spec.estimate = est;
            slot.spec.devices = devices;
            for (dev, bytes) in slot
                .spec
                .estimate
                .gpus
                .iter()
                .zip(&slot.spec.estimate.vram_per_gpu)
            {
                self.ledger.reserve(dev, *bytes);
            }
            self.spawn_task(id);
            return;
        }

        tracing::error!(
            "Failed to load {} (model_key={}): {}",
            slot.spec.model_name,
            slot.spec.model_key.short(),
            error
        );
        let slot = self.loaded.remove(&id).unwrap();
        release_slot_vram(&mut self.ledger, &slot);
        self.remove_key(&slot, id);
        for waiter in slot.waiters {
            let _ = waiter.reply.send(Err(KilnError::ModelLoadFailed(error.clone())));
        }
        self.refresh_snapshot();
    }

    // ── releases, exits, expiry ──────────────────────────────────────

    fn on_released(&mut self, id: RunnerId) {
        let Some(slot) = self.loaded.get_mut(&id) else {
            // late release from a lease on an already-unloaded runner
            return;
        };
        if slot.ref_count == 0 {
            tracing::warn!("Release for runner {} with no outstanding leases", id);
            return;
        }
        slot.ref_count -= 1;
        if slot.ref_count > 0 {
            return;
        }

        if self.shutdown.is_some() || slot.state == RunnerState::Draining {
            self.stop_runner(id);
            return;
        }
        let keep_alive = slot.keep_alive;
        match keep_alive {
            KeepAlive::Immediate => self.stop_runner(id),
            KeepAlive::Forever => {
                let slot = self.loaded.get_mut(&id).unwrap();
                slot.expires_at = None;
            }
            KeepAlive::For(_) => self.schedule_expiry(id, keep_alive),
        }
    }

    fn schedule_expiry(&mut self, id: RunnerId, keep_alive: KeepAlive) {
        let duration = match keep_alive {
            KeepAlive::For(d) => d,
            KeepAlive::Immediate => {
                self.stop_runner(id);
                return;
            }
            KeepAlive::Forever => return,
        };
        let at = Instant::now() + duration;
        let gen = self.next_gen;
        self.next_gen += 1;
        if let Some(slot) = self.loaded.get_mut(&id) {
            slot.expires_at = Some(at);
            slot.expiry_gen = gen;
            self.expiry.push(Reverse(ExpiryEntry { at, gen, runner: id }));
            tracing::debug!("Runner {} expires in {:?}", id, duration);
        }
    }

    fn fire_expiry(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.expiry.peek() {
            if entry.at > now {
                break;
            }
            let Reverse(entry) = self.expiry.pop().unwrap();
            let Some(slot) = self.loaded.get(&entry.runner) else { continue };
            // stale entries from re-arms and re-leases are skipped
            if slot.expiry_gen != entry.gen
                || slot.ref_count != 0
                || slot.state != RunnerState::Ready
            {
                continue;
            }
            tracing::info!("Keep-alive elapsed for {}", slot.spec.model_name);
            self.stop_runner(entry.runner);
        }
    }

    fn on_runner_exited(&mut self, id: RunnerId, code: Option<i32>) {
        let Some(slot) = self.loaded.get(&id) else { return };
        if slot.stopping || slot.state != RunnerState::Ready {
            // expected exit; the stop helper reports Stopped
            return;
        }

        let slot = self.loaded.remove(&id).unwrap();
        tracing::error!(
            "Runner for {} exited unexpectedly (status {:?}, {} leases in flight)",
            slot.spec.model_name,
            code,
            slot.ref_count
        );
        // fail leaseholders: closed permits + the death signal
        let _ = slot.death_tx.send(true);
        slot.permits.close();
        release_slot_vram(&mut self.ledger, &slot);
        self.remove_key(&slot, id);
        self.refresh_snapshot();
    }

    fn on_stopped(&mut self, id: RunnerId) {
        let Some(slot) = self.loaded.remove(&id) else { return };
        release_slot_vram(&mut self.ledger, &slot);
        self.remove_key(&slot, id);
        tracing::info!("Unloaded runner for {}", slot.spec.model_name);
        self.refresh_snapshot();
        self.maybe_finish_shutdown();
    }

    fn on_expire(&mut self, model_key: &ModelKey) {
        let ids: Vec<RunnerId> = self
            .loaded
            .values()
            .filter(|s| &s.spec.model_key == model_key)
            .map(|s| s.id)
            .collect();
        if ids.is_empty() {
            tracing::debug!("Expire for {} matched no runner", model_key.short());
            return;
        }
        for id in ids {
            self.stop_runner(id);
        }
    }

    /// Move a runner toward `Unloaded`: it stops accepting leases now and
    /// the process is stopped once the last lease is gone.
    fn stop_runner(&mut self, id: RunnerId) {
        let Some(slot) = self.loaded.get_mut(&id) else { return };
        if slot.stopping {
            return;
        }
        slot.state = RunnerState::Draining;
        slot.expires_at = None;
        if slot.ref_count > 0 {
            return;
        }
        let Some(handle) = slot.handle.clone() else {
            // still loading; the spawn-finished handler stops it
            return;
        };
        slot.stopping = true;
        let grace = self.cfg.shutdown_grace / 2;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            handle.stop(grace).await;
            let _ = events.send(SchedEvent::Stopped { runner: id });
        });
    }

    // ── eviction ─────────────────────────────────────────────────────

    fn has_idle_victim(&self) -> bool {
        self.loaded
            .values()
            .any(|s| s.state == RunnerState::Ready && s.ref_count == 0 && !s.stopping)
    }

    fn has_draining(&self) -> bool {
        self.loaded
            .values()
            .any(|s| s.state == RunnerState::Draining || s.stopping)
    }

    /// Evict the idle runner closest to expiry, ties broken by largest
    /// VRAM footprint.
    fn evict_one_idle(&mut self) {
        let now = Instant::now();
        let victim = self
            .loaded
            .values()
            .filter(|s| s.state == RunnerState::Ready && s.ref_count == 0 && !s.stopping)
            .min_by_key(|s| {
                (
                    s.expires_at.is_none() as u8,
                    s.expires_at.unwrap_or(now),
                    Reverse(s.spec.estimate.total_vram),
                )
            })
            .map(|s| s.id);
        if let Some(id) = victim {
            let slot = &self.loaded[&id];
            tracing::info!(
                "Evicting idle runner for {} to make room",
                slot.spec.model_name
            );
            self.stop_runner(id);
        }
    }

    // ── shutdown ─────────────────────────────────────────────────────

    fn begin_shutdown(&mut self, grace: Duration, reply: oneshot::Sender<()>) {
        if let Some(shutdown) = &mut self.shutdown {
            shutdown.replies.push(reply);
            return;
        }
        tracing::info!(
            "Scheduler shutting down ({} runners, {} queued)",
            self.loaded.len(),
            self.queued_total()
        );
        self.shutdown = Some(ShutdownState {
            deadline: Instant::now() + grace,
            replies: vec![reply],
        });

        for req in self.parked.drain(..) {
            let _ = req.reply.send(Err(KilnError::ShuttingDown));
        }
        let ids: Vec<RunnerId> = self.loaded.keys().copied().collect();
        for id in &ids {
            let slot = self.loaded.get_mut(id).unwrap();
            for waiter in slot.waiters.drain(..) {
                let _ = waiter.reply.send(Err(KilnError::ShuttingDown));
            }
        }
        for id in ids {
            self.stop_runner(id);
        }
        self.maybe_finish_shutdown();
    }

    fn maybe_finish_shutdown(&mut self) {
        if self.shutdown.is_some() && self.loaded.is_empty() {
            self.finish_shutdown();
        }
    }

    /// Complete the shutdown, forcing a stop on anything still holding
    /// leases. Their stop helpers escalate to SIGKILL on their own.
    fn finish_shutdown(&mut self) {
        let Some(mut shutdown) = self.shutdown.take() else { return };
        for slot in self.loaded.values_mut() {
            if slot.stopping {
                continue;
            }
            if let Some(handle) = slot.handle.clone() {
                slot.stopping = true;
                tokio::spawn(async move {
                    handle.stop(Duration::ZERO).await;
                });
            }
        }
        if !self.loaded.is_empty() {
            tracing::warn!(
                "Shutdown deadline reached with {} runners still draining",
                self.loaded.len()
            );
        }
        for reply in shutdown.replies.drain(..) {
            let _ = reply.send(());
        }
        self.shutdown = Some(shutdown);
        self.shutdown_done = true;
    }

    // ── queue pumping ────────────────────────────────────────────────

    /// Re-attempt parked requests after every state change. Requests that
    /// have waited past twice the load timeout go first; within one waiting
    /// line order is FIFO.
    fn pump(&mut self) {
        if self.shutdown.is_some() {
            for req in self.parked.drain(..) {
                let _ = req.reply.send(Err(KilnError::ShuttingDown));
            }
            return;
        }
        if self.parked.is_empty() {
            return;
        }

        let now = Instant::now();
        let threshold = self.cfg.load_timeout * 2;
        let mut parked = std::mem::take(&mut self.parked);
        let (mut ordered, fresh): (VecDeque<_>, VecDeque<_>) = parked
            .drain(..)
            .partition(|r| now.duration_since(r.enqueued_at) > threshold);
        ordered.extend(fresh);

        let mut blocked: HashSet<(ModelKey, OptionsKey)> = HashSet::new();
        for req in ordered {
            if req.reply.is_closed() {
                tracing::debug!("Dropping canceled request for {}", req.req.model.name);
                continue;
            }
            let key = (req.req.model.key.clone(), req.options_key.clone());
            if blocked.contains(&key) {
                self.parked.push_back(req);
                continue;
            }
            match self.try_admit(req) {
                Admit::Done => {}
                Admit::Parked(req) => {
                    blocked.insert(key);
                    self.parked.push_back(req);
                }
            }
        }
    }

    // ── helpers ──────────────────────────────────────────────────────

    fn active_count(&self) -> usize {
        self.loaded
            .values()
            .filter(|s| matches!(s.state, RunnerState::Loading | RunnerState::Ready))
            .count()
    }

    fn queued_total(&self) -> usize {
        self.parked.len() + self.loaded.values().map(|s| s.waiters.len()).sum::<usize>()
    }

    fn cpu_free(&self) -> u64 {
        self.snapshot.cpu().map(|c| c.free_vram).unwrap_or(u64::MAX)
    }

    fn refresh_snapshot(&mut self) {
        self.snapshot = self.discovery.snapshot();
        self.ledger.sync(&self.snapshot);
    }

    fn remove_key(&mut self, slot: &RunnerSlot, id: RunnerId) {
        let key = (slot.spec.model_key.clone(), slot.spec.options_key.clone());
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
    }

    fn status_rows(&self) -> Vec<RunnerStatus> {
        let now = Instant::now();
        let mut rows: Vec<RunnerStatus> = self
            .loaded
            .values()
            .map(|s| RunnerStatus {
                model: s.spec.model_name.clone(),
                model_key: s.spec.model_key.clone(),
                options_key: s.spec.options_key.clone(),
                state: s.state,
                ref_count: s.ref_count,
                expires_in_secs: s
                    .expires_at
                    .map(|at| at.saturating_duration_since(now).as_secs()),
                vram_total: s.spec.estimate.total_vram,
                gpus: s.spec.estimate.gpus.clone(),
                port: s.handle.as_ref().map(|h| h.port()),
                pid: s.handle.as_ref().and_then(|h| h.pid()),
            })
            .collect();
        rows.sort_by(|a, b| a.model.cmp(&b.model));
        rows
    }
}

fn release_slot_vram(ledger: &mut DeviceLedger, slot: &RunnerSlot) {
    for (dev, bytes) in slot
        .spec
        .estimate
        .gpus
        .iter()
        .zip(&slot.spec.estimate.vram_per_gpu)
    {
        ledger.release(dev, *bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::FixedDiscovery;
    use crate::runner::spawner::SpawnError;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    #[derive(Clone)]
    enum FakeOutcome {
        Ready,
        Stall(Arc<Notify>),
        Oom,
        Fail(SpawnError),
    }

    struct FakeHandle {
        port: u16,
        outcome: FakeOutcome,
        exit: watch::Sender<Option<i32>>,
    }

    #[async_trait::async_trait]
    impl RunnerHandle for FakeHandle {
        fn port(&self) -> u16 {
            self.port
        }

        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait_healthy(&self, limit: Duration) -> std::result::Result<(), SpawnError> {
            match &self.outcome {
                FakeOutcome::Ready => Ok(()),
                FakeOutcome::Oom => Err(SpawnError::OutOfMemory),
                FakeOutcome::Fail(e) => Err(e.clone()),
                FakeOutcome::Stall(gate) => {
                    tokio::select! {
                        _ = gate.notified() => Ok(()),
                        _ = sleep(limit) => Err(SpawnError::LoadTimeout),
                    }
                }
            }
        }

        async fn wait_exit(&self) -> Option<i32> {
            let mut rx = self.exit.subscribe();
            let result = match rx.wait_for(|v| v.is_some()).await {
                Ok(v) => *v,
                Err(_) => None,
            };
            result
        }

        async fn stop(&self, _grace: Duration) {
            let _ = self.exit.send(Some(0));
        }
    }

    #[derive(Default)]
    struct FakeSpawner {
        outcomes: Mutex<VecDeque<FakeOutcome>>,
        specs: Mutex<Vec<SpawnSpec>>,
        handles: Mutex<Vec<Arc<FakeHandle>>>,
        next_port: AtomicU16,
    }

    impl FakeSpawner {
        fn new(outcomes: Vec<FakeOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            })
        }

        fn spawn_count(&self) -> usize {
            self.specs.lock().unwrap().len()
        }

        fn spec(&self, i: usize) -> SpawnSpec {
            self.specs.lock().unwrap()[i].clone()
        }

        /// Simulate the runner process crashing.
        fn kill(&self, i: usize, code: i32) {
            let _ = self.handles.lock().unwrap()[i].exit.send(Some(code));
        }
    }

    #[async_trait::async_trait]
    impl RunnerSpawner for FakeSpawner {
        async fn spawn(
            &self,
            spec: &SpawnSpec,
        ) -> std::result::Result<Arc<dyn RunnerHandle>, SpawnError> {
            self.specs.lock().unwrap().push(spec.clone());
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(FakeOutcome::Ready);
            if let FakeOutcome::Fail(SpawnError::BinaryMissing(e)) = &outcome {
                return Err(SpawnError::BinaryMissing(e.clone()));
            }
            let (exit, _) = watch::channel(None);
            let port = 30000 + self.next_port.fetch_add(1, Ordering::SeqCst);
            let handle = Arc::new(FakeHandle { port, outcome, exit });
            self.handles.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }

    fn gpu_device(id: &str, total: u64, free: u64, os_overhead: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(id),
            library: LibraryTag::Cuda,
            name: "test gpu".into(),
            total_vram: total,
            free_vram: free,
            os_overhead,
            compute_capability: Some((8, 0)),
            dependency_paths: Vec::new(),
        }
    }

    fn cpu_device(total: u64, free: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new("cpu"),
            library: LibraryTag::Cpu,
            name: "system memory".into(),
            total_vram: total,
            free_vram: free,
            os_overhead: 0,
            compute_capability: None,
            dependency_paths: Vec::new(),
        }
    }

    fn snapshot_with(gpus: Vec<DeviceDescriptor>) -> GpuSnapshot {
        let mut devices = gpus;
        devices.push(cpu_device(64 * GIB, 32 * GIB));
        GpuSnapshot::from_devices(devices, None)
    }

    fn single_gpu_snapshot() -> GpuSnapshot {
        snapshot_with(vec![gpu_device("cuda:0", 24 * GIB, 24 * GIB, 512 * MIB)])
    }

    fn test_model(name: &str, blocks: u32, layer_mib: u64) -> ResolvedModel {
        ResolvedModel {
            name: name.into(),
            key: ModelKey::from_manifest_bytes(name.as_bytes()),
            weights_path: "/models/test.gguf".into(),
            metadata: ModelMetadata {
                architecture: "llama".into(),
                block_count: blocks,
                layer_sizes: vec![layer_mib * MIB],
                output_bytes: layer_mib * MIB,
                embedding_length: 1024,
                kv_head_count: 4,
                head_dim: 32,
                projector_bytes: 0,
                capabilities: vec![Capability::Completion, Capability::Embedding],
            },
        }
    }

    fn test_options() -> RunnerOptions {
        RunnerOptions { batch: 8, ..RunnerOptions::default() }
    }

    fn test_cfg() -> SchedulerConfig {
        SchedulerConfig {
            load_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(
        cfg: SchedulerConfig,
        snapshot: GpuSnapshot,
        spawner: Arc<FakeSpawner>,
    ) -> Scheduler {
        Scheduler::new(cfg, Arc::new(FixedDiscovery::new(snapshot)), spawner)
    }

    async fn total_reserved(sched: &Scheduler) -> u64 {
        sched
            .device_reservations()
            .await
            .iter()
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_use_expire() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let lease = sched
            .get_runner(
                test_model("m1", 8, 100),
                test_options(),
                &[Capability::Completion],
                Some(KeepAlive::For(Duration::from_secs(1))),
            )
            .await
            .unwrap();

        let ps = sched.ps().await;
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].state, RunnerState::Ready);
        assert_eq!(ps[0].ref_count, 1);
        assert!(total_reserved(&sched).await > 0);

        drop(lease);
        sleep(Duration::from_millis(1200)).await;

        assert!(sched.ps().await.is_empty());
        assert_eq!(total_reserved(&sched).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow() {
        let gate = Arc::new(Notify::new());
        let spawner = FakeSpawner::new(vec![FakeOutcome::Stall(gate.clone())]);
        let cfg = SchedulerConfig { max_queue: 2, ..test_cfg() };
        let sched = scheduler(cfg, single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        let first = {
            let sched = sched.clone();
            let model = model.clone();
            tokio::spawn(async move {
                sched.get_runner(model, test_options(), &[], None).await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let second = {
            let sched = sched.clone();
            let model = model.clone();
            tokio::spawn(async move {
                sched.get_runner(model, test_options(), &[], None).await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let err = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::QueueFull));

        gate.notify_waiters();
        let l1 = first.await.unwrap().unwrap();
        let l2 = second.await.unwrap().unwrap();
        assert_eq!(spawner.spawn_count(), 1);
        drop((l1, l2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_on_new_model() {
        let spawner = FakeSpawner::new(vec![]);
        let cfg = SchedulerConfig { max_runners: 1, ..test_cfg() };
        let sched = scheduler(cfg, single_gpu_snapshot(), spawner.clone());

        let lease = sched
            .get_runner(test_model("m1", 8, 100), test_options(), &[], None)
            .await
            .unwrap();
        lease.release();
        sleep(Duration::from_millis(10)).await;

        let lease2 = sched
            .get_runner(test_model("m2", 8, 100), test_options(), &[], None)
            .await
            .unwrap();
        let ps = sched.ps().await;
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].model, "m2");
        assert_eq!(spawner.spawn_count(), 2);
        drop(lease2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_permits() {
        let spawner = FakeSpawner::new(vec![]);
        let cfg = SchedulerConfig { default_parallel: 2, ..test_cfg() };
        let sched = scheduler(cfg, single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        let l1 = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap();
        let l2 = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap();
        let l3 = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap();
        assert_eq!(spawner.spawn_count(), 1);

        let p1 = l1.acquire_permit().await.unwrap();
        let _p2 = l2.acquire_permit().await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), l3.acquire_permit())
                .await
                .is_err(),
            "third request should wait on the permit, not spawn"
        );
        drop(p1);
        assert!(timeout(Duration::from_millis(50), l3.acquire_permit())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oom_backoff_respawn() {
        let spawner = FakeSpawner::new(vec![FakeOutcome::Oom]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let lease = sched
            .get_runner(test_model("m1", 40, 100), test_options(), &[], None)
            .await
            .unwrap();

        assert_eq!(spawner.spawn_count(), 2);
        let first = spawner.spec(0);
        let second = spawner.spec(1);
        assert_eq!(first.estimate.layers_offloaded, 41);
        assert_eq!(second.options.num_gpu_layers, Some(20));
        assert_eq!(second.estimate.layers_offloaded, 20);
        assert_eq!(total_reserved(&sched).await, second.estimate.total_vram);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let busy = sched
            .get_runner(test_model("m1", 4, 100), test_options(), &[], None)
            .await
            .unwrap();
        let idle = sched
            .get_runner(test_model("m2", 4, 100), test_options(), &[], None)
            .await
            .unwrap();
        idle.release();
        sleep(Duration::from_millis(10)).await;

        let shut = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.shutdown(Duration::from_secs(2)).await })
        };
        sleep(Duration::from_millis(100)).await;

        let ps = sched.ps().await;
        assert_eq!(ps.len(), 1, "idle runner should stop promptly");
        assert_eq!(ps[0].model, "m1");
        assert_eq!(ps[0].state, RunnerState::Draining);

        let err = sched
            .get_runner(test_model("m3", 4, 100), test_options(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ShuttingDown));

        busy.release();
        shut.await.unwrap();
        assert!(sched.ps().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deadline_with_busy_runner() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let busy = sched
            .get_runner(test_model("m1", 4, 100), test_options(), &[], None)
            .await
            .unwrap();

        // never released: shutdown must still return by its deadline
        assert!(
            timeout(Duration::from_secs(3), sched.shutdown(Duration::from_secs(2)))
                .await
                .is_ok()
        );
        let err = sched
            .get_runner(test_model("m2", 4, 100), test_options(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ShuttingDown));
        drop(busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_zero_unloads_on_release() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let lease = sched
            .get_runner(
                test_model("m1", 8, 100),
                test_options(),
                &[],
                Some(KeepAlive::Immediate),
            )
            .await
            .unwrap();
        lease.release();
        sleep(Duration::from_millis(10)).await;

        assert!(sched.ps().await.is_empty());
        assert_eq!(total_reserved(&sched).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_negative_never_expires() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let lease = sched
            .get_runner(
                test_model("m1", 8, 100),
                test_options(),
                &[],
                Some(KeepAlive::Forever),
            )
            .await
            .unwrap();
        lease.release();
        sleep(Duration::from_secs(3600)).await;

        let ps = sched.ps().await;
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].state, RunnerState::Ready);
        assert_eq!(ps[0].expires_in_secs, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_only_when_no_gpu() {
        let spawner = FakeSpawner::new(vec![]);
        let snapshot = GpuSnapshot::from_devices(vec![cpu_device(64 * GIB, 32 * GIB)], None);
        let sched = scheduler(test_cfg(), snapshot, spawner.clone());

        let lease = sched
            .get_runner(test_model("m1", 8, 100), test_options(), &[], None)
            .await
            .unwrap();
        let spec = spawner.spec(0);
        assert_eq!(spec.estimate.layers_offloaded, 0);
        assert!(spec.estimate.gpus.is_empty());
        assert!(spec.devices.is_empty());
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_fallback_when_model_too_big_for_gpu() {
        let spawner = FakeSpawner::new(vec![]);
        let snapshot = snapshot_with(vec![gpu_device("cuda:0", 24 * GIB, 600 * MIB, 0)]);
        let sched = scheduler(test_cfg(), snapshot, spawner.clone());

        let lease = sched
            .get_runner(test_model("m1", 8, 500), test_options(), &[], None)
            .await
            .unwrap();
        let spec = spawner.spec(0);
        assert_eq!(spec.estimate.layers_offloaded, 0);
        assert!(spec.estimate.gpus.is_empty());
        assert_eq!(total_reserved(&sched).await, 0);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_feasible_device() {
        let spawner = FakeSpawner::new(vec![]);
        // host memory is too small for the tail as well
        let mut devices = vec![gpu_device("cuda:0", 24 * GIB, 600 * MIB, 0)];
        devices.push(cpu_device(4 * GIB, GIB));
        let snapshot = GpuSnapshot::from_devices(devices, None);
        let sched = scheduler(test_cfg(), snapshot, spawner.clone());

        let err = sched
            .get_runner(test_model("m1", 8, 4000), test_options(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::NoFeasibleDevice));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_capability_missing() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let mut model = test_model("m1", 8, 100);
        model.metadata.capabilities = vec![Capability::Completion];
        let err = sched
            .get_runner(model, test_options(), &[Capability::Vision], None)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::CapabilityMissing(Capability::Vision)));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_death_fails_leases() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        let lease = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap();
        spawner.kill(0, 1);
        sleep(Duration::from_millis(10)).await;

        assert!(lease.is_dead());
        assert!(matches!(
            lease.acquire_permit().await,
            Err(KilnError::RunnerDied)
        ));
        assert!(sched.ps().await.is_empty());
        assert_eq!(total_reserved(&sched).await, 0);

        // a dead runner is not retried; the next request loads afresh
        let lease2 = sched
            .get_runner(model, test_options(), &[], None)
            .await
            .unwrap();
        assert_eq!(spawner.spawn_count(), 2);
        drop((lease, lease2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_timeout_fails_request() {
        let gate = Arc::new(Notify::new());
        let spawner = FakeSpawner::new(vec![FakeOutcome::Stall(gate)]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let err = sched
            .get_runner(test_model("m1", 8, 100), test_options(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KilnError::ModelLoadFailed(SpawnError::LoadTimeout)
        ));
        assert!(sched.ps().await.is_empty());
        assert_eq!(total_reserved(&sched).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_releases_vram() {
        let spawner = FakeSpawner::new(vec![FakeOutcome::Fail(SpawnError::Health(
            "tensor shape mismatch".into(),
        ))]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        let err = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ModelLoadFailed(SpawnError::Health(_))));
        assert_eq!(total_reserved(&sched).await, 0);

        // the failure is not sticky
        let lease = sched
            .get_runner(model, test_options(), &[], None)
            .await
            .unwrap();
        assert_eq!(spawner.spawn_count(), 2);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_draining_runner_accepts_no_leases() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        let l1 = sched
            .get_runner(model.clone(), test_options(), &[], Some(KeepAlive::Forever))
            .await
            .unwrap();
        sched.expire_runner(&model.key);
        sleep(Duration::from_millis(10)).await;

        let ps = sched.ps().await;
        assert_eq!(ps[0].state, RunnerState::Draining);
        assert_eq!(ps[0].ref_count, 1);

        let second = {
            let sched = sched.clone();
            let model = model.clone();
            tokio::spawn(async move {
                sched.get_runner(model, test_options(), &[], None).await
            })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "request must wait out the drain");

        l1.release();
        let l2 = second.await.unwrap().unwrap();
        assert_eq!(spawner.spawn_count(), 2);
        let ps = sched.ps().await;
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].state, RunnerState::Ready);
        drop(l2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_runner_idempotent() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        // expiring nothing is fine
        sched.expire_runner(&model.key);
        sleep(Duration::from_millis(10)).await;

        let lease = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap();
        lease.release();
        sched.expire_runner(&model.key);
        sched.expire_runner(&model.key);
        sleep(Duration::from_millis(10)).await;

        assert!(sched.ps().await.is_empty());
        assert_eq!(total_reserved(&sched).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_returns_to_idle() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        let lease = sched
            .get_runner(model.clone(), test_options(), &[], None)
            .await
            .unwrap();
        let ps = sched.ps().await;
        assert_eq!(ps[0].ref_count, 1);
        assert_eq!(ps[0].expires_in_secs, None);

        lease.release();
        sleep(Duration::from_millis(10)).await;
        let ps = sched.ps().await;
        assert_eq!(ps[0].ref_count, 0);
        assert_eq!(ps[0].state, RunnerState::Ready);
        let expires = ps[0].expires_in_secs.unwrap();
        assert!(expires > 0 && expires <= 300, "expires in {}s", expires);

        // re-leasing matches the same runner and disarms expiry
        let lease = sched
            .get_runner(model, test_options(), &[], None)
            .await
            .unwrap();
        assert_eq!(spawner.spawn_count(), 1);
        let ps = sched.ps().await;
        assert_eq!(ps[0].ref_count, 1);
        assert_eq!(ps[0].expires_in_secs, None);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_gpu_spills_second_model_to_cpu() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        // m1 takes ~20 GiB of the 23.5 GiB budget and stays busy
        let l1 = sched
            .get_runner(test_model("m1", 40, 500), test_options(), &[], None)
            .await
            .unwrap();
        assert!(spawner.spec(0).estimate.fully_loaded);
        let m1_reserved = total_reserved(&sched).await;

        // m2's layers are too big for the remaining budget; with no idle
        // victim it lands on the CPU and the ledger is untouched
        let l2 = sched
            .get_runner(test_model("m2", 4, 4000), test_options(), &[], None)
            .await
            .unwrap();
        let spec = spawner.spec(1);
        assert_eq!(spec.estimate.layers_offloaded, 0);
        assert!(spec.estimate.gpus.is_empty());
        assert_eq!(total_reserved(&sched).await, m1_reserved);
        drop((l1, l2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_idle_to_fit_fully() {
        let spawner = FakeSpawner::new(vec![]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());

        let l1 = sched
            .get_runner(test_model("m1", 40, 500), test_options(), &[], None)
            .await
            .unwrap();
        l1.release();
        sleep(Duration::from_millis(10)).await;

        // an idle 20 GiB runner is worth more unloaded than a partial fit
        let l2 = sched
            .get_runner(test_model("m2", 40, 500), test_options(), &[], None)
            .await
            .unwrap();
        assert_eq!(spawner.spawn_count(), 2);
        assert!(spawner.spec(1).estimate.fully_loaded);
        let ps = sched.ps().await;
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].model, "m2");
        drop(l2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_queued() {
        let gate = Arc::new(Notify::new());
        let spawner = FakeSpawner::new(vec![FakeOutcome::Stall(gate.clone())]);
        let sched = scheduler(test_cfg(), single_gpu_snapshot(), spawner.clone());
        let model = test_model("m1", 8, 100);

        let first = {
            let sched = sched.clone();
            let model = model.clone();
            tokio::spawn(async move {
                sched.get_runner(model, test_options(), &[], None).await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let second = {
            let sched = sched.clone();
            let model = model.clone();
            tokio::spawn(async move {
                sched.get_runner(model, test_options(), &[], None).await
            })
        };
        sleep(Duration::from_millis(10)).await;
        second.abort();
        sleep(Duration::from_millis(10)).await;

        gate.notify_waiters();
        let l1 = first.await.unwrap().unwrap();
        sleep(Duration::from_millis(10)).await;

        // the canceled waiter never took a ref-count slot
        let ps = sched.ps().await;
        assert_eq!(ps[0].ref_count, 1);
        assert_eq!(spawner.spawn_count(), 1);
        drop(l1);
    }
}
