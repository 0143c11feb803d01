//! Debounced background rebuild of the search shards.
//!
//! A single worker thread watches for ledger activity: events published by
//! the in-process [`LedgerStore`] and, every poll interval, the row counts
//! of the pending and completed ledgers (which also catches writes made by
//! other processes). Each observed change pushes the rebuild deadline one
//! quiet period into the future; the shards are rebuilt once activity has
//! settled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use super::SearchIndex;
use crate::ledger::{CompletedRecord, LedgerEvent, LedgerKind, LedgerStore, PendingRecord};

/// Upper bound on a single wait so shutdown is noticed promptly.
const TICK: Duration = Duration::from_millis(100);

enum Command {
    RebuildNow,
    Shutdown,
}

pub struct IndexScheduler {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    rebuilds: Arc<AtomicU64>,
}

impl IndexScheduler {
    /// Starts the worker. An index that is not ready is rebuilt right away.
    pub fn start(
        index: Arc<SearchIndex>,
        ledger: Arc<LedgerStore>,
        quiet_period: Duration,
        poll_interval: Duration,
    ) -> Self {
        let (commands, command_rx) = unbounded();
        let events = ledger.subscribe();
        let shutdown = Arc::new(AtomicBool::new(false));
        let rebuilds = Arc::new(AtomicU64::new(0));

        let worker = {
            let shutdown = Arc::clone(&shutdown);
            let rebuilds = Arc::clone(&rebuilds);
            thread::spawn(move || {
                let watcher = Watcher {
                    index,
                    ledger,
                    quiet_period,
                    poll_interval,
                    rebuilds,
                };
                watcher.run(command_rx, events, shutdown);
            })
        };

        info!(
            "Index scheduler started (quiet period {:?}, poll every {:?})",
            quiet_period, poll_interval
        );

        Self {
            commands,
            worker: Some(worker),
            shutdown,
            rebuilds,
        }
    }

    /// Asks for a rebuild as soon as possible. Never blocks.
    pub fn request_rebuild(&self) {
        if self.commands.send(Command::RebuildNow).is_err() {
            debug!("Index scheduler is stopped; rebuild request dropped");
        }
    }

    /// Number of rebuilds completed by the worker so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        info!("Shutting down index scheduler...");
        self.shutdown.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = worker.join() {
            error!("Index scheduler panicked: {:?}", e);
        }
    }
}

impl Drop for IndexScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Watcher {
    index: Arc<SearchIndex>,
    ledger: Arc<LedgerStore>,
    quiet_period: Duration,
    poll_interval: Duration,
    rebuilds: Arc<AtomicU64>,
}

impl Watcher {
    fn run(&self, commands: Receiver<Command>, events: Receiver<LedgerEvent>, shutdown: Arc<AtomicBool>) {
        let mut deadline = (!self.index.is_ready()).then(Instant::now);
        let mut counts = self.row_counts();
        let mut next_poll = Instant::now() + self.poll_interval;

        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            if let Some(due) = deadline.filter(|due| *due <= now) {
                debug!("Rebuild due ({:?} late)", now.duration_since(due));
                deadline = self.rebuild();
                continue;
            }

            let wake = deadline.map_or(next_poll, |due| due.min(next_poll));
            let wait = wake.saturating_duration_since(now).min(TICK);

            match commands.recv_timeout(wait) {
                Ok(Command::RebuildNow) => {
                    debug!("Rebuild requested");
                    deadline = Some(Instant::now());
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            // Activity rows never change what search returns.
            let relevant = events
                .try_iter()
                .filter(|event| event.kind != LedgerKind::Activity)
                .count();
            if relevant > 0 {
                deadline = Some(self.quiet_deadline(deadline));
            }

            if Instant::now() >= next_poll {
                next_poll = Instant::now() + self.poll_interval;
                let current = self.row_counts();
                if current != counts {
                    debug!("Ledger row counts changed: {:?} -> {:?}", counts, current);
                    counts = current;
                    deadline = Some(self.quiet_deadline(deadline));
                }
            }
        }

        debug!("Index scheduler stopped");
    }

    /// Pushes the deadline a full quiet period out, unless an immediate
    /// rebuild is already pending.
    fn quiet_deadline(&self, current: Option<Instant>) -> Instant {
        let quiet = Instant::now() + self.quiet_period;
        match current {
            Some(due) if due <= Instant::now() => due,
            _ => quiet,
        }
    }

    fn row_counts(&self) -> Option<(usize, usize)> {
        let pending = self.ledger.count::<PendingRecord>().ok()?;
        let completed = self.ledger.count::<CompletedRecord>().ok()?;
        Some((pending, completed))
    }

    /// Runs one rebuild; a failure is retried after another quiet period.
    fn rebuild(&self) -> Option<Instant> {
        match self.index.rebuild() {
            Ok(_) => {
                self.rebuilds.fetch_add(1, Ordering::AcqRel);
                None
            }
            Err(e) => {
                error!("Search index rebuild failed: {}", e);
                Some(Instant::now() + self.quiet_period)
            }
        }
    }
}
