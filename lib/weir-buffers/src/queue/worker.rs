//! Worker threads, the DA driver, and shutdown handling.
//!
//! Every queue has a fixed table of worker slots; slot 0 is reserved for the
//! disk-assistance driver and stays dormant on queues that never promote.
//! Workers block on the `not_empty` condition and are commanded through the
//! per-slot state machine. Shutdown is a protocol, not a cancellation:
//! `Shutdown` lets a worker drain the queue, `ShutdownImmediate` stops it
//! after the current item, and a worker that ignores both past the
//! immediate timeout is abandoned, losing at most its one in-flight item.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use crate::internal_events::{emit_consumer_error, emit_discarded, emit_messages_lost};
use crate::Bufferable;

use super::{
    chk_persist, enqueue_impl, QueueError, QueueKind, QueueSettings, RunMode, Shared, State,
    WorkerCmd,
};

/// True when any worker slot (including the driver) is active.
pub(super) fn any_active<T: Bufferable>(st: &State<T>) -> bool {
    st.workers.iter().any(|c| c.is_active())
}

/// Joins a terminated worker and reclaims its slot. Must be called without
/// the queue mutex held.
fn harvest<T: Bufferable>(shared: &Arc<Shared<T>>, slot: usize) {
    let handle = shared.thrd.lock().handles[slot].take();
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!(queue = %shared.settings.id, slot, "worker thread panicked");
        }
    }
    let mut st = shared.state.lock();
    if st.workers[slot] == WorkerCmd::Terminating {
        st.workers[slot] = WorkerCmd::Stopped;
    }
}

/// Spawns a worker on the given slot. The active count is raised at spawn
/// request time and only ever lowered by the exiting worker itself, so a
/// slot can never be harvested between request and completion.
fn spawn_worker<T: Bufferable>(
    shared: &Arc<Shared<T>>,
    st: &mut MutexGuard<'_, State<T>>,
    slot: usize,
) {
    if st.workers[slot] == WorkerCmd::Terminating {
        MutexGuard::unlocked(st, || harvest(shared, slot));
    }
    if st.workers[slot] != WorkerCmd::Stopped {
        return;
    }
    st.workers[slot] = WorkerCmd::RunCreated;

    let arc = Arc::clone(shared);
    let mut spawned = false;
    MutexGuard::unlocked(st, || {
        let mut thrd = shared.thrd.lock();
        thrd.active += 1;
        let name = format!("{}-w{}", shared.settings.id, slot);
        match std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_main(arc, slot))
        {
            Ok(handle) => {
                thrd.handles[slot] = Some(handle);
                spawned = true;
            }
            Err(e) => {
                thrd.active -= 1;
                error!(queue = %shared.settings.id, slot, error = %e, "could not spawn worker thread");
            }
        }
    });
    if !spawned && st.workers[slot] == WorkerCmd::RunCreated {
        st.workers[slot] = WorkerCmd::Stopped;
    }
}

/// Starts one regular worker on the first free slot.
pub(super) fn start_regular_worker<T: Bufferable>(
    shared: &Arc<Shared<T>>,
    st: &mut MutexGuard<'_, State<T>>,
) {
    let slot = (1..st.workers.len()).find(|&i| !st.workers[i].is_active());
    if let Some(slot) = slot {
        spawn_worker(shared, st, slot);
    }
}

/// Dispatch rules for regular mode: one worker as soon as there is work,
/// additional workers when occupancy passes the high watermark.
pub(super) fn chk_and_start_workers<T: Bufferable>(
    shared: &Arc<Shared<T>>,
    st: &mut MutexGuard<'_, State<T>>,
) {
    if st.enq_only || st.in_destruction || st.run_mode != RunMode::Regular {
        return;
    }
    let active = st.workers[1..].iter().filter(|c| c.is_active()).count();
    if active == 0 || (st.size >= st.hwm && active < shared.settings.num_workers) {
        start_regular_worker(shared, st);
    }
}

/// Flags the queue as promoting and makes sure the driver slot is running.
pub(super) fn init_da<T: Bufferable>(
    shared: &Arc<Shared<T>>,
    st: &mut MutexGuard<'_, State<T>>,
    child_enq_only: bool,
) {
    st.run_mode = RunMode::DaInit;
    st.da_child_enq_only = child_enq_only;
    if !st.enq_only {
        spawn_worker(shared, st, 0);
    }
}

/// Sends `cmd` to every active worker without ever downgrading a slot.
fn tell_workers<T: Bufferable>(shared: &Shared<T>, cmd: WorkerCmd) {
    let mut st = shared.state.lock();
    for c in st.workers.iter_mut() {
        if c.is_active() && *c < cmd {
            *c = cmd;
        }
    }
}

fn wake_all<T: Bufferable>(shared: &Shared<T>) {
    shared.not_empty.notify_all();
    shared.cond_da.notify_all();
    shared.not_full.notify_all();
}

/// Waits for the active worker count to reach zero; `None` waits forever.
fn wait_drain<T: Bufferable>(shared: &Shared<T>, timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|d| Instant::now() + d);
    let mut thrd = shared.thrd.lock();
    while thrd.active > 0 {
        match deadline {
            Some(deadline) => {
                if shared
                    .cond_thrd_trm
                    .wait_until(&mut thrd, deadline)
                    .timed_out()
                {
                    return thrd.active == 0;
                }
            }
            None => shared.cond_thrd_trm.wait(&mut thrd),
        }
    }
    true
}

/// Two-phase worker shutdown with abandonment as the last resort.
pub(super) fn shutdown_workers<T: Bufferable>(
    shared: &Arc<Shared<T>>,
    to_regular: Option<Duration>,
    to_immediate: Option<Duration>,
) {
    debug!(queue = %shared.settings.id, "initiating worker shutdown sequence");
    tell_workers(shared, WorkerCmd::Shutdown);
    wake_all(shared);
    if !wait_drain(shared, to_regular) {
        debug!(queue = %shared.settings.id, "regular worker shutdown timed out, trying immediate");
        tell_workers(shared, WorkerCmd::ShutdownImmediate);
        wake_all(shared);
        if !wait_drain(shared, to_immediate) {
            abandon_workers(shared);
        }
    }
    let n_slots = shared.state.lock().workers.len();
    for slot in 0..n_slots {
        harvest(shared, slot);
    }
}

/// Detaches workers that ignored both shutdown phases. Each loses at most
/// the one item it holds; the loss is reported once, as a summary.
fn abandon_workers<T: Bufferable>(shared: &Arc<Shared<T>>) {
    let stuck: Vec<usize> = {
        let st = shared.state.lock();
        (0..st.workers.len())
            .filter(|&i| st.workers[i].is_active())
            .collect()
    };
    if stuck.is_empty() {
        return;
    }
    {
        let mut st = shared.state.lock();
        st.lost_in_flight += stuck.len() as u64;
    }
    {
        let mut thrd = shared.thrd.lock();
        for &slot in &stuck {
            thrd.handles[slot] = None;
        }
    }
    emit_messages_lost(&shared.settings.id, stuck.len() as u64);
    warn!(
        queue = %shared.settings.id,
        workers = stuck.len(),
        "workers did not stop in time and were abandoned, one in-flight message lost each"
    );
}

/// Decides whether a worker keeps running. Regular workers run while
/// commanded to, or while draining under a regular shutdown. The DA driver
/// additionally retires itself once both parent and child are empty, which
/// triggers demotion.
fn remain_active<T: Bufferable>(st: &State<T>, slot: usize) -> bool {
    let cmd = st.workers[slot];
    let mut active =
        cmd == WorkerCmd::Running || (cmd == WorkerCmd::Shutdown && st.size > 0);
    if active && slot == 0 && st.run_mode == RunMode::Da {
        let child_size = st.da_child.as_ref().map(|c| c.size()).unwrap_or(0);
        active = st.size > 0 || (!st.in_destruction && child_size > 0);
    }
    active
}

/// Creates, wires, and starts the disk child queue, then switches the
/// parent into DA mode. Regular workers are shut down (not joined) so the
/// driver has the queue to itself.
fn da_startup<T: Bufferable>(shared: &Arc<Shared<T>>) -> Result<(), QueueError> {
    let child_enq_only = {
        let st = shared.state.lock();
        st.da_child_enq_only
    };
    let s = &shared.settings;
    let mut cs = QueueSettings::new(format!("{}-da", s.id), QueueKind::Disk);
    cs.max_size = 0;
    cs.num_workers = 1;
    cs.high_watermark = 0;
    cs.low_watermark = 0;
    cs.discard_watermark = 0;
    cs.discard_severity = 8;
    cs.enqueue_timeout = s.enqueue_timeout;
    // With an obviously large backlog on disk there is no point holding a
    // long drain phase; the child either finishes fast or persists.
    cs.shutdown_timeout = s.shutdown_timeout.map(|_| Duration::from_millis(1));
    cs.shutdown_immediate_timeout = s.shutdown_immediate_timeout;
    cs.worker_idle_timeout = s.worker_idle_timeout;
    cs.persist_every = s.persist_every;
    cs.dir = s.dir.clone();
    cs.file_prefix = s.file_prefix.clone();
    cs.max_file_size = s.max_file_size;

    let child = super::Queue::with_parent(cs, Arc::clone(&shared.consumer), Arc::downgrade(shared))?;
    if child_enq_only {
        child.set_enqueue_only(true)?;
    }
    child.start()?;

    let mut st = shared.state.lock();
    st.da_child = Some(child);
    st.run_mode = RunMode::Da;
    for slot in 1..st.workers.len() {
        if st.workers[slot].is_active() && st.workers[slot] < WorkerCmd::ShutdownImmediate {
            st.workers[slot] = WorkerCmd::ShutdownImmediate;
        }
    }
    drop(st);
    shared.not_empty.notify_all();
    debug!(queue = %shared.settings.id, "now running in disk-assisted mode");
    Ok(())
}

/// The driver's per-item step: move one parent item to the disk child,
/// then rest at the low watermark until pressure returns or the child
/// drains.
fn da_consume<T: Bufferable>(shared: &Arc<Shared<T>>, item: T) {
    let child_shared = {
        let st = shared.state.lock();
        st.da_child.as_ref().map(|c| Arc::clone(&c.shared))
    };
    match child_shared {
        Some(child) => {
            if let Err(e) = enqueue_impl(&child, item) {
                emit_messages_lost(&shared.settings.id, 1);
                error!(
                    queue = %shared.settings.id,
                    error = %e,
                    "could not move message to disk child, message lost"
                );
            }
        }
        None => {
            // Child vanished under us (demotion race): deliver directly so
            // the item is not lost.
            if let Err(e) = (shared.consumer)(item) {
                emit_consumer_error(&shared.settings.id);
                debug!(queue = %shared.settings.id, error = %e, "consumer returned error");
            }
        }
    }

    let mut st = shared.state.lock();
    let child_size = st.da_child.as_ref().map(|c| c.size()).unwrap_or(0);
    if st.size <= st.lwm && st.workers[0] == WorkerCmd::Running && child_size > 0 {
        trace!(
            queue = %shared.settings.id,
            size = st.size,
            "passed low watermark in DA mode, driver resting"
        );
        shared.cond_da.wait(&mut st);
    }
}

/// Tears down the drained child and returns the queue to regular mode,
/// reviving a regular worker if messages arrived in the meantime.
fn turn_off_da<T: Bufferable>(shared: &Arc<Shared<T>>) {
    let child = {
        let mut st = shared.state.lock();
        st.run_mode = RunMode::Regular;
        let child = st.da_child.take();
        if !st.in_destruction && !st.enq_only && st.size > 0 {
            start_regular_worker(shared, &mut st);
        }
        child
    };
    if let Some(child) = child {
        child.stop();
    }
    debug!(queue = %shared.settings.id, "disk assistance turned off");
}

/// The worker thread body, for both regular slots and the DA driver.
fn worker_main<T: Bufferable>(shared: Arc<Shared<T>>, slot: usize) {
    let id = shared.settings.id.clone();
    trace!(queue = %id, slot, "worker thread startup");

    if slot == 0 {
        let needs_startup = shared.state.lock().run_mode != RunMode::Da;
        if needs_startup {
            if let Err(e) = da_startup(&shared) {
                error!(queue = %id, error = %e, "error creating disk queue, disk assistance disabled");
                let mut st = shared.state.lock();
                st.da_broken = true;
                st.run_mode = RunMode::Regular;
                st.workers[0] = WorkerCmd::ShutdownImmediate;
                chk_and_start_workers(&shared, &mut st);
            }
        }
    }

    {
        let mut st = shared.state.lock();
        if st.workers[slot] == WorkerCmd::RunCreated {
            st.workers[slot] = WorkerCmd::RunInit;
        }
        if st.workers[slot] == WorkerCmd::RunInit {
            st.workers[slot] = WorkerCmd::Running;
        }
    }

    loop {
        let mut st = shared.state.lock();
        if !remain_active(&st, slot) {
            break;
        }

        if st.size == 0 {
            // A drained DA child tells its parent, so the parent's driver
            // can wake up and consider demotion.
            if let Some(parent) = shared.parent.as_ref().and_then(Weak::upgrade) {
                trace!(queue = %id, slot, "signalling parent that child queue is empty");
                parent.cond_da.notify_all();
                parent.not_empty.notify_all();
            }
            match shared.settings.worker_idle_timeout {
                // The DA driver and the first regular worker never
                // self-demote.
                Some(idle) if slot >= 2 => {
                    if shared.not_empty.wait_for(&mut st, idle).timed_out()
                        && st.workers[slot] == WorkerCmd::Running
                    {
                        debug!(queue = %id, slot, "inactivity timeout, worker terminating");
                        st.workers[slot] = WorkerCmd::Shutdown;
                    }
                }
                _ => shared.not_empty.wait(&mut st),
            }
            continue;
        }

        let Some(backing) = st.backing.as_mut() else {
            break;
        };
        let item = backing.del();
        st.size -= 1;
        shared.size_hint.store(st.size, Ordering::Relaxed);
        chk_persist(&shared, &mut st);
        let qsize = st.size;
        let run_mode = st.run_mode;
        drop(st);
        shared.not_full.notify_all();

        let item = match item {
            Ok(item) => item,
            Err(e) => {
                // The size count is already adjusted; skipping keeps the
                // queue live at the cost of this one record.
                error!(queue = %id, slot, error = %e, "error dequeueing element, record skipped");
                continue;
            }
        };

        if slot == 0 && run_mode == RunMode::Da {
            da_consume(&shared, item);
        } else {
            let dwm = shared.settings.discard_watermark;
            let discard = dwm > 0
                && qsize >= dwm
                && item
                    .severity()
                    .map_or(false, |s| s >= shared.settings.discard_severity);
            if discard {
                emit_discarded(&id, item.severity().unwrap_or(0));
                debug!(queue = %id, slot, size = qsize, "queue nearly full, discarded message at dequeue");
            } else if let Err(e) = (shared.consumer)(item) {
                emit_consumer_error(&id);
                debug!(queue = %id, slot, error = %e, "consumer returned error");
            }
        }
    }

    if slot == 0 && shared.state.lock().run_mode != RunMode::Regular {
        turn_off_da(&shared);
    }

    {
        let mut st = shared.state.lock();
        st.workers[slot] = WorkerCmd::Terminating;
    }
    {
        let mut thrd = shared.thrd.lock();
        thrd.active = thrd.active.saturating_sub(1);
    }
    shared.cond_thrd_trm.notify_all();
    trace!(queue = %id, slot, "worker thread exiting");
}
