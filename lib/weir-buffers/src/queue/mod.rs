//! The queue core.
//!
//! A queue owns an ordered collection of items behind one of four backings,
//! plus the worker pool that drains it into a user-supplied consumer. Memory
//! backings configured with a file prefix are *disk-assisted*: when
//! occupancy reaches the high watermark, worker slot 0 becomes a driver that
//! moves items into a disk-backed child queue, and tears the child down
//! again once both queues have drained. Disk queues persist a queue-info
//! record (`<prefix>.qi`) so they can resume after a restart.
//!
//! Locking discipline: the queue mutex guards occupancy, the backing, and
//! the worker command table; the thread-management mutex guards spawn/join
//! bookkeeping so no thread is ever joined while the queue mutex is held. A
//! disk-assisted child has its own queue mutex; parent and child mutexes are
//! never held at the same time.

mod backing;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::internal_events::{
    emit_consumer_error, emit_discarded, emit_dropped_full, emit_messages_lost,
    emit_persist_error,
};
use crate::serial::{self, ObjectId, PropType, RecordType, SerialError};
use crate::stream::{StreamError, StreamReader, StreamSpec, StreamState, StreamType, StreamWriter};
use crate::Bufferable;

use backing::Backing;

/// Segment-number namespace for queue spool files. Large enough that a
/// wrap-around never overtakes the reader in practice.
const SPOOL_MAX_SEGMENTS: u32 = 10_000_000;

/// The backing behind a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Preallocated ring of `max_size` slots.
    FixedArray,
    /// Allocate-on-demand list.
    LinkedList,
    /// On-disk ring of segment files.
    Disk,
    /// No buffering: the consumer runs on the producer's thread.
    Direct,
}

impl QueueKind {
    pub fn is_memory(self) -> bool {
        matches!(self, QueueKind::FixedArray | QueueKind::LinkedList)
    }
}

/// Whether the queue currently runs disk-assisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Regular,
    DaInit,
    Da,
}

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("queue size must be greater than zero"))]
    SizeZero,
    #[snafu(display("disk queues require a file prefix"))]
    MissingFilePrefix,
    #[snafu(display("max file size {size} is below the minimum of 1024"))]
    MaxFileSizeTooLow { size: u64 },
    #[snafu(display("queue has not been started"))]
    NotStarted,
    #[snafu(display("leaving enqueue-only mode is not supported on a started queue"))]
    EnqueueOnlyIrreversible,
    #[snafu(display("queue backing is corrupted"))]
    Corrupted,
    #[snafu(context(false))]
    Stream { source: StreamError },
    #[snafu(context(false))]
    Serial { source: SerialError },
}

#[derive(Debug, Snafu)]
pub enum EnqueueError {
    #[snafu(display("queue full"))]
    QueueFull,
    #[snafu(display("queue is shut down"))]
    QueueShutdown,
    #[snafu(display("queue has not been started"))]
    QueueNotStarted,
}

/// Error type consumers report; the queue logs it and moves on.
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// The per-item delivery callback. Must be thread-safe: in regular mode it
/// runs on worker threads, in direct mode on the producer's thread.
pub type Consumer<T> = Arc<dyn Fn(T) -> Result<(), ConsumerError> + Send + Sync>;

/// Queue construction parameters.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    /// Name used in logs and metrics labels.
    pub id: String,
    pub kind: QueueKind,
    /// Capacity bound; 0 means unbounded (disk queues only).
    pub max_size: usize,
    pub num_workers: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    /// 0 disables severity-gated discarding.
    pub discard_watermark: usize,
    /// Items with severity numerically >= this are discardable; 8 disables.
    pub discard_severity: u8,
    /// How long a full-queue enqueue blocks; `None` waits forever.
    pub enqueue_timeout: Option<Duration>,
    /// Phase-one shutdown drain budget; `None` waits forever.
    pub shutdown_timeout: Option<Duration>,
    /// Phase-two budget before in-flight workers are abandoned.
    pub shutdown_immediate_timeout: Option<Duration>,
    /// Idle workers self-demote after this; `None` keeps them alive.
    pub worker_idle_timeout: Option<Duration>,
    /// Rewrite the queue-info record every N updates; 0 = shutdown only.
    pub persist_every: u32,
    /// Directory holding spool and queue-info files.
    pub dir: PathBuf,
    /// Spool file prefix. On memory backings this enables disk assistance.
    pub file_prefix: Option<String>,
    /// Per-segment size bound for spool files.
    pub max_file_size: u64,
    /// Spill memory residue to disk on shutdown instead of dropping it.
    pub save_on_shutdown: bool,
}

impl QueueSettings {
    pub fn new(id: impl Into<String>, kind: QueueKind) -> Self {
        QueueSettings {
            id: id.into(),
            kind,
            max_size: 10_000,
            num_workers: 1,
            high_watermark: 9_000,
            low_watermark: 3_000,
            discard_watermark: 0,
            discard_severity: 8,
            enqueue_timeout: Some(Duration::from_millis(2_000)),
            shutdown_timeout: Some(Duration::from_millis(1_500)),
            shutdown_immediate_timeout: Some(Duration::from_millis(1_000)),
            worker_idle_timeout: Some(Duration::from_secs(60)),
            persist_every: 0,
            dir: PathBuf::from("."),
            file_prefix: None,
            max_file_size: 1024 * 1024,
            save_on_shutdown: true,
        }
    }
}

/// Worker slot command states. Transitions are monotonic except that
/// `Terminating` may be entered from any active state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum WorkerCmd {
    Stopped,
    RunCreated,
    RunInit,
    Running,
    Shutdown,
    ShutdownImmediate,
    Terminating,
}

impl WorkerCmd {
    pub(crate) fn is_active(self) -> bool {
        !matches!(self, WorkerCmd::Stopped | WorkerCmd::Terminating)
    }
}

pub(crate) struct State<T: Bufferable> {
    pub(crate) backing: Option<Backing<T>>,
    pub(crate) size: usize,
    pub(crate) run_mode: RunMode,
    pub(crate) enq_only: bool,
    pub(crate) read_only: bool,
    pub(crate) in_destruction: bool,
    pub(crate) started: bool,
    pub(crate) stopped: bool,
    pub(crate) da_broken: bool,
    pub(crate) da_child_enq_only: bool,
    pub(crate) upds_since_persist: u32,
    pub(crate) need_del_qi: bool,
    /// Slot 0 is the DA driver; 1..=num_workers are regular workers.
    pub(crate) workers: Vec<WorkerCmd>,
    pub(crate) da_child: Option<Queue<T>>,
    pub(crate) lost_in_flight: u64,
    /// Watermarks live here rather than in the settings because shutdown
    /// tightens them to force a drain.
    pub(crate) hwm: usize,
    pub(crate) lwm: usize,
}

pub(crate) struct ThrdMgmt {
    pub(crate) handles: Vec<Option<JoinHandle<()>>>,
    pub(crate) active: usize,
}

pub(crate) struct Shared<T: Bufferable> {
    pub(crate) settings: QueueSettings,
    pub(crate) is_disk_assisted: bool,
    pub(crate) state: Mutex<State<T>>,
    pub(crate) not_empty: Condvar,
    pub(crate) not_full: Condvar,
    pub(crate) cond_da: Condvar,
    pub(crate) thrd: Mutex<ThrdMgmt>,
    pub(crate) cond_thrd_trm: Condvar,
    pub(crate) consumer: Consumer<T>,
    pub(crate) size_hint: AtomicUsize,
    /// Set on disk-assisted children: signalled when this queue drains
    /// empty, so the parent's driver can wake and demote.
    pub(crate) parent: Option<Weak<Shared<T>>>,
}

impl<T: Bufferable> Shared<T> {
    pub(crate) fn qi_path(&self) -> Option<PathBuf> {
        self.settings
            .file_prefix
            .as_ref()
            .map(|p| self.settings.dir.join(format!("{p}.qi")))
    }

    fn spool_spec(&self) -> Result<StreamSpec, QueueError> {
        let prefix = self
            .settings
            .file_prefix
            .clone()
            .ok_or(QueueError::MissingFilePrefix)?;
        Ok(StreamSpec {
            dir: self.settings.dir.clone(),
            prefix,
            stream_type: StreamType::Circular,
            max_segments: SPOOL_MAX_SEGMENTS,
            max_segment_size: self.settings.max_file_size,
        })
    }
}

/// A bounded FIFO with an integrated worker pool.
///
/// Dropping the queue runs the full shutdown sequence (drain per policy,
/// join workers, persist residue).
pub struct Queue<T: Bufferable> {
    shared: Arc<Shared<T>>,
}

impl<T: Bufferable> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.shared.settings.id)
            .field("size", &self.size())
            .finish()
    }
}

impl<T: Bufferable> Queue<T> {
    pub fn new(settings: QueueSettings, consumer: Consumer<T>) -> Result<Self, QueueError> {
        Self::build(settings, consumer, None)
    }

    /// Internal constructor for disk-assisted children, wired back to the
    /// parent for empty-queue signalling.
    pub(crate) fn with_parent(
        settings: QueueSettings,
        consumer: Consumer<T>,
        parent: Weak<Shared<T>>,
    ) -> Result<Self, QueueError> {
        Self::build(settings, consumer, Some(parent))
    }

    fn build(
        mut settings: QueueSettings,
        consumer: Consumer<T>,
        parent: Option<Weak<Shared<T>>>,
    ) -> Result<Self, QueueError> {
        if settings.kind.is_memory() && settings.max_size == 0 {
            return Err(QueueError::SizeZero);
        }
        if settings.kind == QueueKind::Disk && settings.file_prefix.is_none() {
            return Err(QueueError::MissingFilePrefix);
        }
        let uses_disk = settings.kind == QueueKind::Disk
            || (settings.kind.is_memory() && settings.file_prefix.is_some());
        if uses_disk && settings.max_file_size < 1024 {
            return Err(QueueError::MaxFileSizeTooLow {
                size: settings.max_file_size,
            });
        }
        settings.num_workers = settings.num_workers.max(1);

        let is_disk_assisted = settings.kind.is_memory() && settings.file_prefix.is_some();
        let hwm = settings.high_watermark;
        let lwm = settings.low_watermark;
        let num_workers = settings.num_workers;

        let shared = Arc::new(Shared {
            settings,
            is_disk_assisted,
            state: Mutex::new(State {
                backing: None,
                size: 0,
                run_mode: RunMode::Regular,
                enq_only: false,
                read_only: false,
                in_destruction: false,
                started: false,
                stopped: false,
                da_broken: false,
                da_child_enq_only: false,
                upds_since_persist: 0,
                need_del_qi: false,
                workers: vec![WorkerCmd::Stopped; num_workers + 1],
                da_child: None,
                lost_in_flight: 0,
                hwm,
                lwm,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            cond_da: Condvar::new(),
            thrd: Mutex::new(ThrdMgmt {
                handles: (0..=num_workers).map(|_| None).collect(),
                active: 0,
            }),
            cond_thrd_trm: Condvar::new(),
            consumer,
            size_hint: AtomicUsize::new(0),
            parent,
        });
        Ok(Queue { shared })
    }

    /// Finalizes the backing and spawns workers. For disk queues (and
    /// disk-assisted queues with leftover spool files), a pre-existing
    /// queue-info record is reloaded and consumption resumes where the
    /// previous run stopped.
    pub fn start(&self) -> Result<(), QueueError> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.started {
            return Ok(());
        }

        let backing = match shared.settings.kind {
            QueueKind::FixedArray => Backing::fixed_array(shared.settings.max_size),
            QueueKind::LinkedList => Backing::linked_list(),
            QueueKind::Direct => Backing::Direct,
            QueueKind::Disk => {
                let (backing, size) = construct_disk(shared)?;
                st.size = size;
                shared.size_hint.store(size, Ordering::Relaxed);
                if size > 0 {
                    st.need_del_qi = true;
                }
                backing
            }
        };
        st.backing = Some(backing);
        st.started = true;

        debug!(
            queue = %shared.settings.id,
            kind = ?shared.settings.kind,
            disk_assisted = shared.is_disk_assisted,
            size = st.size,
            "queue starting"
        );

        if shared.settings.kind == QueueKind::Direct {
            return Ok(());
        }

        // A leftover queue-info file means the previous run spilled to disk
        // and could not drain; resume in DA mode so the spool is consumed.
        let have_qi = shared
            .qi_path()
            .map(|p| p.exists())
            .unwrap_or(false);
        if shared.is_disk_assisted && have_qi {
            debug!(queue = %shared.settings.id, "on-disk spool present, resuming disk-assisted");
            worker::init_da(shared, &mut st, false);
        } else if !st.enq_only {
            worker::start_regular_worker(shared, &mut st);
        }
        Ok(())
    }

    /// Enqueues one item, blocking up to the enqueue timeout when the queue
    /// is full. Items above the discard watermark with a discardable
    /// severity are silently dropped.
    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError> {
        enqueue_impl(&self.shared, item)
    }

    /// Switches the queue to enqueue-only operation: running workers are
    /// told to stop after their current item and no new worker is ever
    /// dispatched. The reverse transition is unsupported once started.
    pub fn set_enqueue_only(&self, on: bool) -> Result<(), QueueError> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if on == st.enq_only {
            return Ok(());
        }
        if !on && st.started {
            return Err(QueueError::EnqueueOnlyIrreversible);
        }
        st.enq_only = on;
        if on && st.started {
            for cmd in st.workers.iter_mut() {
                if cmd.is_active() {
                    *cmd = WorkerCmd::ShutdownImmediate;
                }
            }
            drop(st);
            shared.not_empty.notify_all();
            shared.cond_da.notify_all();
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.shared.size_hint.load(Ordering::Relaxed)
    }

    pub fn run_mode(&self) -> RunMode {
        self.shared.state.lock().run_mode
    }

    /// Messages lost to abandoned workers over the queue's lifetime.
    pub fn lost_in_flight(&self) -> u64 {
        self.shared.state.lock().lost_in_flight
    }

    pub fn id(&self) -> &str {
        &self.shared.settings.id
    }

    /// Shuts the queue down: drain within the regular timeout, escalate to
    /// immediate shutdown, abandon stuck workers as a last resort, persist
    /// residue, and join. Idempotent.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.stopped || !st.started {
            st.stopped = true;
            return;
        }
        st.in_destruction = true;

        let mut drain_timeout = shared.settings.shutdown_timeout;
        if !st.enq_only {
            if shared.is_disk_assisted && st.size > 0 {
                // Tighten watermarks so the driver pulls everything, and
                // make sure the residue lands on disk rather than in the
                // consumer's lap.
                st.hwm = 1;
                st.lwm = 0;
                match st.run_mode {
                    RunMode::Regular => {
                        if shared.settings.save_on_shutdown {
                            worker::init_da(shared, &mut st, true);
                        }
                    }
                    _ => {
                        if let Some(child) = &st.da_child {
                            let _ = child.set_enqueue_only(true);
                        }
                    }
                }
                if shared.settings.save_on_shutdown {
                    drain_timeout = None;
                }
                shared.cond_da.notify_all();
            } else if st.size > 0 && !worker::any_active(&st) {
                // Plain memory queue with residue and no worker: give the
                // drain phase something to run.
                worker::start_regular_worker(shared, &mut st);
            }
        }
        drop(st);

        worker::shutdown_workers(
            shared,
            drain_timeout,
            shared.settings.shutdown_immediate_timeout,
        );

        let child = {
            let mut st = shared.state.lock();
            st.run_mode = RunMode::Regular;
            st.da_child.take()
        };
        if let Some(child) = child {
            child.stop();
        }

        let mut st = shared.state.lock();
        if let Err(e) = persist(shared, &mut st) {
            emit_persist_error(&shared.settings.id);
            error!(queue = %shared.settings.id, error = %e, "error persisting queue, data lost");
        }
        if st.size > 0 && shared.settings.kind.is_memory() {
            emit_messages_lost(&shared.settings.id, st.size as u64);
            warn!(
                queue = %shared.settings.id,
                count = st.size,
                "shutting down non-empty memory queue, messages lost"
            );
        }
        st.stopped = true;
        debug!(queue = %shared.settings.id, lost = st.lost_in_flight, "queue stopped");
    }
}

impl<T: Bufferable> Drop for Queue<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/* ------------------------------- enqueue -------------------------------- */

/// The enqueue path, shared between the public API and the DA driver's
/// writes into the child queue.
pub(crate) fn enqueue_impl<T: Bufferable>(
    shared: &Arc<Shared<T>>,
    item: T,
) -> Result<(), EnqueueError> {
    if shared.settings.kind == QueueKind::Direct {
        {
            let st = shared.state.lock();
            if !st.started {
                return Err(EnqueueError::QueueNotStarted);
            }
            if st.stopped {
                return Err(EnqueueError::QueueShutdown);
            }
        }
        // Direct mode never buffers: the consumer runs right here on the
        // producer's thread.
        if let Err(e) = (shared.consumer)(item) {
            emit_consumer_error(&shared.settings.id);
            debug!(queue = %shared.settings.id, error = %e, "direct consumer failed");
        }
        return Ok(());
    }

    let mut st = shared.state.lock();
    if !st.started {
        return Err(EnqueueError::QueueNotStarted);
    }
    if st.stopped {
        return Err(EnqueueError::QueueShutdown);
    }
    if st.read_only {
        return Err(EnqueueError::QueueFull);
    }

    // Discard gate: under pressure, severities at or above the threshold
    // are dropped before they ever take a slot.
    let dwm = shared.settings.discard_watermark;
    if dwm > 0 && st.size >= dwm {
        if let Some(sev) = item.severity() {
            if sev >= shared.settings.discard_severity {
                emit_discarded(&shared.settings.id, sev);
                debug!(
                    queue = %shared.settings.id,
                    size = st.size,
                    severity = sev,
                    "queue nearly full, discarded message"
                );
                return Ok(());
            }
        }
    }

    // Disk assistance: hitting the high watermark exactly promotes the
    // queue; while promoted, crossing it again nudges the driver. Sizes are
    // serialized under the queue mutex, so every climb through the
    // watermark observes the equality once.
    if shared.is_disk_assisted && !st.da_broken && st.size == st.hwm {
        if st.run_mode == RunMode::Regular {
            debug!(
                queue = %shared.settings.id,
                size = st.size,
                "passed high watermark, initiating disk-assisted mode"
            );
            worker::init_da(shared, &mut st, false);
        } else {
            shared.cond_da.notify_all();
        }
    }

    worker::chk_and_start_workers(shared, &mut st);

    // Wait for room.
    if shared.settings.max_size > 0 {
        let deadline = shared
            .settings
            .enqueue_timeout
            .map(|d| std::time::Instant::now() + d);
        while st.size >= shared.settings.max_size {
            let timed_out = match deadline {
                Some(deadline) => shared.not_full.wait_until(&mut st, deadline).timed_out(),
                None => {
                    shared.not_full.wait(&mut st);
                    false
                }
            };
            if timed_out && st.size >= shared.settings.max_size {
                emit_dropped_full(&shared.settings.id);
                debug!(queue = %shared.settings.id, "enqueue timed out on full queue");
                shared.not_empty.notify_all();
                return Err(EnqueueError::QueueFull);
            }
        }
    }

    let backing = st.backing.as_mut().expect("backing exists after start");
    if let Err(e) = backing.add(item) {
        // A failed spool write with no fallback makes the queue read-only;
        // producers see it as full from here on.
        error!(queue = %shared.settings.id, error = %e, "backing write failed, queue now read-only");
        st.read_only = true;
        emit_dropped_full(&shared.settings.id);
        return Err(EnqueueError::QueueFull);
    }
    st.size += 1;
    shared.size_hint.store(st.size, Ordering::Relaxed);
    chk_persist(shared, &mut st);
    drop(st);
    shared.not_empty.notify_all();
    Ok(())
}

/* ------------------------------ persistence ----------------------------- */

/// Builds the disk backing, resuming from a queue-info record if one
/// exists.
fn construct_disk<T: Bufferable>(shared: &Shared<T>) -> Result<(Backing<T>, usize), QueueError> {
    if let Some(loaded) = try_load_persisted(shared)? {
        return Ok(loaded);
    }
    let spec = shared.spool_spec()?;
    let write = StreamWriter::create(spec.clone())?;
    let read = StreamReader::open(spec, true)?;
    Ok((Backing::disk(write, read), 0))
}

/// Loads `<prefix>.qi`: one property bag with the queue size, then the
/// serialized write stream, then the read stream (same order as persisted).
fn try_load_persisted<T: Bufferable>(
    shared: &Shared<T>,
) -> Result<Option<(Backing<T>, usize)>, QueueError> {
    let Some(qi) = shared.qi_path() else {
        return Ok(None);
    };
    if !qi.exists() {
        debug!(queue = %shared.settings.id, "clean startup, no .qi file found");
        return Ok(None);
    }

    let qi_name = qi
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut rdr = StreamReader::open(
        StreamSpec {
            dir: shared.settings.dir.clone(),
            prefix: qi_name,
            stream_type: StreamType::SingleFile,
            max_segments: 0,
            max_segment_size: 0,
        },
        false,
    )?;

    serial::read_header(&mut rdr, RecordType::PropBag)?;
    let props = serial::read_properties(&mut rdr)?;
    let size = props
        .iter()
        .find(|p| p.name == "iQueueSize")
        .and_then(|p| p.value.as_num())
        .unwrap_or(0)
        .max(0) as usize;

    serial::read_header(&mut rdr, RecordType::Object)?;
    let wstate = StreamState::from_properties(&serial::read_properties(&mut rdr)?)?;
    serial::read_header(&mut rdr, RecordType::Object)?;
    let rstate = StreamState::from_properties(&serial::read_properties(&mut rdr)?)?;

    let write = StreamWriter::from_state(
        &shared.settings.dir,
        &wstate,
        shared.settings.max_file_size,
    )?;
    let read = StreamReader::from_state(
        &shared.settings.dir,
        &rstate,
        shared.settings.max_file_size,
    )?;

    debug!(
        queue = %shared.settings.id,
        size,
        "resumed queue from .qi file"
    );
    Ok(Some((Backing::disk(write, read), size)))
}

/// Rewrites the queue-info record for a disk queue. On an empty queue the
/// record is deleted instead and the spool becomes delete-on-close.
pub(crate) fn persist<T: Bufferable>(
    shared: &Shared<T>,
    st: &mut State<T>,
) -> Result<(), QueueError> {
    if shared.settings.kind != QueueKind::Disk {
        return Ok(());
    }
    let Some(qi) = shared.qi_path() else {
        return Ok(());
    };
    let size = st.size;
    let Some((write, read)) = st.backing.as_mut().and_then(|b| b.disk_streams()) else {
        return Ok(());
    };

    if size == 0 {
        if st.need_del_qi {
            if let Err(e) = std::fs::remove_file(&qi) {
                debug!(path = %qi.display(), error = %e, "could not remove .qi file");
            }
            st.need_del_qi = false;
        }
        read.set_delete_on_close(true);
        return Ok(());
    }

    debug!(queue = %shared.settings.id, size, "persisting queue to disk");

    let qi_name = qi
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut out = StreamWriter::create(StreamSpec {
        dir: shared.settings.dir.clone(),
        prefix: qi_name,
        stream_type: StreamType::SingleFile,
        max_segments: 0,
        max_segment_size: 0,
    })?;

    serial::begin_record(&mut out, RecordType::PropBag, ObjectId::Queue, 1)?;
    serial::write_prop_num(&mut out, "iQueueSize", PropType::Int, size as i64)?;
    serial::end_record(&mut out)?;

    write.flush()?;
    write.state().serialize(&mut out)?;
    // Persist the reader with segment cleanup enabled, then disable it for
    // this process: the file the next run resumes from must survive the
    // close, but consumed segments after a resume must still be removed.
    read.set_delete_on_close(true);
    read.state().serialize(&mut out)?;
    read.set_delete_on_close(false);
    out.flush()?;

    st.need_del_qi = true;
    Ok(())
}

/// Persists every `persist_every` updates. Errors are logged, not
/// propagated: persistence is best effort while the queue is live.
pub(crate) fn chk_persist<T: Bufferable>(shared: &Shared<T>, st: &mut State<T>) {
    if shared.settings.persist_every == 0 || shared.settings.kind != QueueKind::Disk {
        return;
    }
    st.upds_since_persist += 1;
    if st.upds_since_persist >= shared.settings.persist_every {
        if let Err(e) = persist(shared, st) {
            emit_persist_error(&shared.settings.id);
            error!(queue = %shared.settings.id, error = %e, "periodic queue persist failed");
        }
        st.upds_since_persist = 0;
    }
}
