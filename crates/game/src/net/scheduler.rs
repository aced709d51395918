use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

type Task = Box<dyn FnMut() + Send>;

struct Entry {
    id: TaskId,
    period: Duration,
    next_run: Instant,
    task: Task,
}

#[derive(Default)]
struct Tasks {
    entries: Vec<Entry>,
    /// Ids of tasks currently out of the table on the timer thread.
    in_flight: Vec<TaskId>,
    removed: Vec<TaskId>,
}

/// Runs periodic tasks on a single timer thread.
///
/// Tasks are taken out of the table while they run, so a task may add or
/// remove tasks (itself included) without deadlocking.
pub struct Scheduler {
    tasks: Arc<Mutex<Tasks>>,
    running: Arc<AtomicBool>,
    next_id: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts the timer thread, waking every `resolution` to look for due tasks.
    pub fn start(resolution: Duration) -> std::io::Result<Self> {
        let tasks: Arc<Mutex<Tasks>> = Arc::default();
        let running = Arc::new(AtomicBool::new(true));
        let timer = {
            let tasks = Arc::clone(&tasks);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("strata-scheduler".into())
                .spawn(move || run(&tasks, &running, resolution))?
        };
        Ok(Self {
            tasks,
            running,
            next_id: AtomicU64::new(0),
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Registers `task` to run every `period`, first after one period.
    pub fn add_task<F>(&self, period: Duration, task: F) -> TaskId
    where
        F: FnMut() + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tasks.lock().entries.push(Entry {
            id,
            period,
            next_run: Instant::now() + period,
            task: Box::new(task),
        });
        id
    }

    pub fn remove_task(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.entries.len();
        tasks.entries.retain(|entry| entry.id != id);
        if tasks.entries.len() != before {
            return true;
        }
        // Running right now; dropped when it comes back.
        if tasks.in_flight.contains(&id) && !tasks.removed.contains(&id) {
            tasks.removed.push(id);
            return true;
        }
        false
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().entries.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the timer thread and waits for it. Pending tasks are dropped.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::warn!("scheduler thread panicked");
            }
        }
        self.tasks.lock().entries.clear();
    }
}

fn run(tasks: &Mutex<Tasks>, running: &AtomicBool, resolution: Duration) {
    while running.load(Ordering::Acquire) {
        thread::sleep(resolution);

        let now = Instant::now();
        let mut due = {
            let mut tasks = tasks.lock();
            let (due, idle): (Vec<Entry>, Vec<Entry>) = tasks
                .entries
                .drain(..)
                .partition(|entry| entry.next_run <= now);
            tasks.entries = idle;
            tasks.in_flight = due.iter().map(|entry| entry.id).collect();
            due
        };
        if due.is_empty() {
            continue;
        }

        for entry in &mut due {
            (entry.task)();
            // Skip missed periods rather than bursting to catch up.
            entry.next_run += entry.period;
            if entry.next_run <= now {
                entry.next_run = now + entry.period;
            }
        }

        let mut tasks = tasks.lock();
        tasks.in_flight.clear();
        let removed = std::mem::take(&mut tasks.removed);
        tasks
            .entries
            .extend(due.into_iter().filter(|entry| !removed.contains(&entry.id)));
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.task_count())
            .field("running", &self.is_running())
            .finish()
    }
}
