use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct ScheduledTask {
    pub name: &'static str,
    pub period: Duration,
    pub task: Box<dyn Fn() + Send>,
}

/// One thread per stream. The task runs inline, so a stream is never
/// re-entered; boundaries that pass while a tick is still working are
/// skipped rather than queued. The first tick fires immediately.
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(tasks: Vec<ScheduledTask>) -> Scheduler {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = tasks
            .into_iter()
            .map(|task| {
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || run_stream(task, shutdown))
            })
            .collect();
        Scheduler { shutdown, handles }
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("scheduler thread panicked during shutdown");
            }
        }
        info!("scheduler stopped");
    }
}

fn run_stream(task: ScheduledTask, shutdown: Arc<AtomicBool>) {
    let start = Instant::now();
    let mut next_tick = Duration::ZERO;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        (task.task)();

        let elapsed = start.elapsed();
        next_tick += task.period;
        let mut skipped = 0u32;
        while next_tick <= elapsed {
            next_tick += task.period;
            skipped += 1;
        }
        if skipped > 0 {
            debug!(stream = task.name, skipped, "tick overran; boundaries dropped");
        }
        if !sleep_until(start, next_tick, &shutdown) {
            return;
        }
    }
}

/// Sleeps in short slices so a shutdown request is honoured within about a
/// second. Returns false when shutting down.
fn sleep_until(start: Instant, deadline: Duration, shutdown: &AtomicBool) -> bool {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return true;
        }
        let remaining = deadline - elapsed;
        thread::sleep(remaining.min(Duration::from_millis(250)));
    }
}
