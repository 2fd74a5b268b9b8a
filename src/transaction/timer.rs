use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// A polled timer wheel. Entries are ordered by deadline in a BTreeMap with
/// the task id as a tiebreaker; the endpoint drains due entries from its
/// serve loop, so no per-timer task is spawned.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert((deadline, id), value);
        }
        if let Ok(mut deadlines) = self.deadlines.write() {
            deadlines.insert(id, deadline);
        }
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self
            .deadlines
            .write()
            .ok()
            .and_then(|mut deadlines| deadlines.remove(&id))?;
        self.tasks
            .write()
            .ok()
            .and_then(|mut tasks| tasks.remove(&(deadline, id)))
    }

    /// Remove and return every entry due at or before `now`, in deadline
    /// order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let drained: Vec<u64> = {
            let mut tasks = match self.tasks.write() {
                Ok(tasks) => tasks,
                Err(_) => return due,
            };
            let keys: Vec<(Instant, u64)> = tasks
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect();
            due.reserve(keys.len());
            for key in keys.iter() {
                if let Some(value) = tasks.remove(key) {
                    due.push(value);
                }
            }
            keys.into_iter().map(|(_, id)| id).collect()
        };
        if let Ok(mut deadlines) = self.deadlines.write() {
            for id in drained {
                deadlines.remove(&id);
            }
        }
        due
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_timer() {
    let timer = Timer::new();
    let now = Instant::now();
    let id = timer.timeout_at(now, "task1");
    assert_eq!(timer.cancel(id), Some("task1"));
    assert_eq!(timer.cancel(id), None);

    timer.timeout_at(now, "task2");
    let due = timer.poll(now + Duration::from_secs(1));
    assert_eq!(due, vec!["task2"]);

    timer.timeout_at(now + Duration::from_millis(1001), "task3");
    let due = timer.poll(now + Duration::from_secs(1));
    assert!(due.is_empty());
    assert_eq!(timer.len(), 1);
}

#[test]
fn test_timer_orders_by_deadline() {
    let timer = Timer::new();
    let now = Instant::now();
    timer.timeout_at(now + Duration::from_millis(30), "third");
    timer.timeout_at(now + Duration::from_millis(10), "first");
    timer.timeout_at(now + Duration::from_millis(20), "second");
    let due = timer.poll(now + Duration::from_millis(50));
    assert_eq!(due, vec!["first", "second", "third"]);
}
