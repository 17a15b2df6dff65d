//! Idle detection for directory triggers.
//!
//! A directory is ready once its recursive size is unchanged across one cooldown and no
//! directory below it is still being watched. Timers live in a mutex-protected map serviced
//! by one timer thread; rescheduling never blocks a caller.

use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::catalog::ModuleRule;
use crate::engine::tools::is_strict_ancestor;
use crate::snapshot::dir_size;

/// Size source for idle checks.
pub trait SizeMeter: Send + Sync + 'static {
    fn size_of(&self, path: &Path) -> u64;
}

impl<T: SizeMeter + ?Sized> SizeMeter for Arc<T> {
    fn size_of(&self, path: &Path) -> u64 {
        (**self).size_of(path)
    }
}

/// Recursive sum of file sizes on disk.
pub struct DirSizeMeter;

impl SizeMeter for DirSizeMeter {
    fn size_of(&self, path: &Path) -> u64 {
        dir_size(path)
    }
}

/// A directory confirmed idle for `rule`.
#[derive(Clone, Debug)]
pub struct IdleDirectory {
    pub path: PathBuf,
    pub rule: Arc<ModuleRule>,
}

type TimerKey = (PathBuf, String);

struct IdleTimer {
    rule: Arc<ModuleRule>,
    last_size: u64,
    due_at: Instant,
}

#[derive(Default)]
struct TimerState {
    timers: HashMap<TimerKey, IdleTimer>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
    cooldown: Duration,
    meter: Box<dyn SizeMeter>,
    on_idle: Box<dyn Fn(IdleDirectory) + Send + Sync>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap()
    }
}

/// Debounces directory triggers until the directory stops growing.
pub struct IdleDetector {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl IdleDetector {
    /// Start the timer thread. `on_idle` runs on that thread, with the timer lock held, once
    /// per confirmed directory; keep it short (e.g. a channel send).
    pub fn new<P, F>(cooldown: Duration, meter: P, on_idle: F) -> Self
    where
        P: SizeMeter,
        F: Fn(IdleDirectory) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
            cooldown,
            meter: Box::new(meter),
            on_idle: Box::new(on_idle),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::spawn(move || timer_loop(&worker));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Start watching `path` for `rule`. Returns false if that pair is already being watched.
    pub fn on_directory_trigger(&self, path: &Path, rule: Arc<ModuleRule>) -> bool {
        let key = (path.to_path_buf(), rule.name.clone());
        if self.shared.lock().timers.contains_key(&key) {
            return false;
        }
        let last_size = self.shared.meter.size_of(path);
        let mut st = self.shared.lock();
        if st.shutdown || st.timers.contains_key(&key) {
            return false;
        }
        debug!(
            "idle watch {} for {} (size {})",
            path.display(),
            rule.name,
            last_size
        );
        st.timers.insert(
            key,
            IdleTimer {
                rule,
                last_size,
                due_at: Instant::now() + self.shared.cooldown,
            },
        );
        drop(st);
        self.shared.wake.notify_one();
        true
    }

    /// Number of directories still under evaluation.
    pub fn active_count(&self) -> usize {
        self.shared.lock().timers.len()
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.shared.lock().timers.keys().any(|(p, _)| p == path)
    }

    /// Stop the timer thread. Pending timers are dropped without firing.
    pub fn shutdown(&mut self) {
        {
            let mut st = self.shared.lock();
            st.shutdown = true;
            st.timers.clear();
        }
        self.shared.wake.notify_all();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for IdleDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: &Shared) {
    let mut st = shared.lock();
    loop {
        if st.shutdown {
            return;
        }
        let now = Instant::now();
        let mut due: Vec<TimerKey> = st
            .timers
            .iter()
            .filter(|(_, t)| t.due_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        if due.is_empty() {
            st = match st.timers.values().map(|t| t.due_at).min() {
                Some(next) => shared.wake.wait_timeout(st, next - now).unwrap().0,
                None => shared.wake.wait(st).unwrap(),
            };
            continue;
        }

        // Deepest first, so a child confirmed in this batch no longer holds back its parent.
        due.sort_by_key(|(p, _)| std::cmp::Reverse(p.components().count()));

        // Measure without the lock; sizing a large tree can take a while.
        drop(st);
        let sizes: Vec<(TimerKey, u64)> = due
            .into_iter()
            .map(|key| {
                let size = shared.meter.size_of(&key.0);
                (key, size)
            })
            .collect();
        st = shared.lock();
        if st.shutdown {
            return;
        }

        for (key, size) in sizes {
            let has_active_descendant = st
                .timers
                .keys()
                .any(|(other, _)| is_strict_ancestor(&key.0, other));
            let Some(timer) = st.timers.get_mut(&key) else {
                continue;
            };
            if size == timer.last_size && !has_active_descendant {
                if let Some(timer) = st.timers.remove(&key) {
                    debug!("idle {} for {} (size {})", key.0.display(), timer.rule.name, size);
                    (shared.on_idle)(IdleDirectory {
                        path: key.0,
                        rule: timer.rule,
                    });
                }
            } else {
                debug!(
                    "not idle {} (size {} -> {}, active descendant: {})",
                    key.0.display(),
                    timer.last_size,
                    size,
                    has_active_descendant
                );
                timer.last_size = size;
                timer.due_at = Instant::now() + shared.cooldown;
            }
        }
    }
}
