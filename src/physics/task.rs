//! Task-queue façade.
//!
//! The solver needs two primitives: enqueue a parallel-for over an index
//! range, and join on it. The built-in dispatcher spawns one OS thread
//! per range chunk with a deterministic chunk-to-worker assignment; hosts
//! with their own scheduler implement [`TaskDispatcher`] instead.
//!
//! A worker index addresses per-worker scratch and always lies in
//! `0..worker_count`. It is not an OS thread id: the same worker index is
//! never handed to two concurrent chunks of one task, but different tasks
//! may run the same worker index on different threads.

use crate::physics::MAX_WORKERS;

/// Parallel-for body: `(start, end, worker_index, ctx)`.
///
/// The context pointer is shared across threads for the task's lifetime;
/// implementations must only touch worker-disjoint or appropriately
/// synchronized state through it.
pub type TaskFn = unsafe fn(start: i32, end: i32, worker_index: u32, ctx: *mut u8);

/// Join handle for an enqueued task.
pub struct TaskHandle {
    joins: Vec<std::thread::JoinHandle<()>>,
}

/// Host-provided scheduling. `enqueue` may execute inline and return
/// `None`; the caller then skips the finish call.
pub trait TaskDispatcher: Send + Sync {
    /// Number of workers tasks may be split across, in `1..=MAX_WORKERS`.
    fn worker_count(&self) -> i32;

    /// Runs `task` over `[0, item_count)`, split into chunks of at least
    /// `min_range` items.
    ///
    /// # Safety
    /// `ctx` must stay valid until the returned handle is finished (or,
    /// for `None`, until this call returns).
    unsafe fn enqueue(
        &self,
        task: TaskFn,
        item_count: i32,
        min_range: i32,
        ctx: *mut u8,
    ) -> Option<TaskHandle>;

    /// Joins an enqueued task.
    fn finish(&self, handle: TaskHandle);
}

#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
// The dispatcher contract makes the pointee outlive the join; sharing the
// raw pointer across the spawned threads is the whole point.
unsafe impl Send for SendPtr {}

/// Built-in dispatcher: spawns a thread per chunk. Chunk boundaries and
/// worker assignment depend only on (item_count, min_range, worker_count),
/// keeping per-worker output deterministic for a given worker count.
pub struct ThreadDispatcher {
    worker_count: i32,
}

impl ThreadDispatcher {
    pub fn new(worker_count: i32) -> Self {
        Self {
            worker_count: worker_count.clamp(1, MAX_WORKERS as i32),
        }
    }
}

impl TaskDispatcher for ThreadDispatcher {
    fn worker_count(&self) -> i32 {
        self.worker_count
    }

    unsafe fn enqueue(
        &self,
        task: TaskFn,
        item_count: i32,
        min_range: i32,
        ctx: *mut u8,
    ) -> Option<TaskHandle> {
        debug_assert!(item_count > 0 && min_range > 0);

        let chunk_count = (item_count / min_range.max(1))
            .clamp(1, self.worker_count);

        // Even with one chunk the work runs on its own thread: the solver
        // enqueues one single-item task per worker and expects them to
        // run concurrently while the main thread waits in finish.
        let base = item_count / chunk_count;
        let remainder = item_count - base * chunk_count;

        let mut joins = Vec::with_capacity(chunk_count as usize);
        let mut start = 0;
        for worker_index in 0..chunk_count {
            let count = base + if worker_index < remainder { 1 } else { 0 };
            let end = start + count;
            let ptr = SendPtr(ctx);
            joins.push(std::thread::spawn(move || {
                let ptr = ptr;
                unsafe { task(start, end, worker_index as u32, ptr.0) };
            }));
            start = end;
        }
        debug_assert!(start == item_count);

        Some(TaskHandle { joins })
    }

    fn finish(&self, handle: TaskHandle) {
        for join in handle.joins {
            join.join().expect("worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    static SUM: AtomicI32 = AtomicI32::new(0);

    unsafe fn accumulate(start: i32, end: i32, _worker: u32, ctx: *mut u8) {
        let items = ctx as *const i32;
        let mut local = 0;
        for i in start..end {
            local += *items.add(i as usize);
        }
        SUM.fetch_add(local, Ordering::Relaxed);
    }

    #[test]
    fn chunks_cover_the_range_exactly_once() {
        let items: Vec<i32> = (0..1000).collect();
        let dispatcher = ThreadDispatcher::new(4);
        SUM.store(0, Ordering::Relaxed);
        unsafe {
            let handle = dispatcher.enqueue(accumulate, 1000, 16, items.as_ptr() as *mut u8);
            if let Some(handle) = handle {
                dispatcher.finish(handle);
            }
        }
        assert_eq!(SUM.load(Ordering::Relaxed), 999 * 1000 / 2);
    }
}
