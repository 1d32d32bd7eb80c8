//! A fixed-size worker pool for the resolver and the check engine.
//!
//! Tasks are fallible closures; the first failure is captured and re-raised
//! by `wait()` on the orchestrating thread once every in-flight task has
//! finished. After a failure no queued task starts (cooperative
//! cancellation): workers drain the queue but skip the bodies.
//!
//! Tasks may submit further tasks through a cloned handle, which is how the
//! execution plan releases dependents from inside a worker.

use crossbeam::queue::MsQueue;
use failure::{format_err, Error};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread,
};

use crate::util::errors::Res;

type Task = Box<dyn FnOnce() -> Res<()> + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

#[derive(Default)]
struct State {
    pending: usize,
    error: Option<Error>,
    throw_on_error: bool,
}

struct Inner {
    queue: MsQueue<Message>,
    state: Mutex<State>,
    done: Condvar,
    threads: usize,
}

pub struct Executor {
    inner: Arc<Inner>,
    // empty in cloned handles; only the owning Executor joins
    workers: Vec<thread::JoinHandle<()>>,
}

/// The pool size used when the caller has no opinion.
pub fn max_threads() -> usize {
    std::cmp::max(8, num_cpus::get())
}

impl Executor {
    pub fn new(threads: usize) -> Self {
        let threads = std::cmp::max(1, threads);
        let inner = Arc::new(Inner {
            queue: MsQueue::new(),
            state: Mutex::new(State::default()),
            done: Condvar::new(),
            threads,
        });

        let workers = (0..threads)
            .map(|_| {
                let inner = inner.clone();
                thread::spawn(move || worker(&inner))
            })
            .collect();

        Executor { inner, workers }
    }

    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    /// Queues a task. Dropped silently if a failure was already recorded and
    /// `throw_on_error` is set; the plan has stopped pulling new work.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> Res<()> + Send + 'static,
    {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.error.is_some() && st.throw_on_error {
                return;
            }
            st.pending += 1;
        }
        self.inner.queue.push(Message::Run(Box::new(task)));
    }

    pub fn set_throw_on_error(&self, throw: bool) {
        self.inner.state.lock().unwrap().throw_on_error = throw;
    }

    /// Blocks until every submitted task has completed or been cancelled,
    /// then re-raises the first captured failure (if `throw_on_error`).
    /// The executor is reusable afterwards.
    pub fn wait(&self) -> Res<()> {
        let mut st = self.inner.state.lock().unwrap();
        while st.pending > 0 {
            st = self.inner.done.wait(st).unwrap();
        }
        let err = st.error.take();
        if st.throw_on_error {
            if let Some(e) = err {
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Clone for Executor {
    fn clone(&self) -> Self {
        Executor {
            inner: self.inner.clone(),
            workers: Vec::new(),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for _ in &self.workers {
            self.inner.queue.push(Message::Shutdown);
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker(inner: &Arc<Inner>) {
    loop {
        match inner.queue.pop() {
            Message::Shutdown => break,
            Message::Run(task) => {
                let cancelled = {
                    let st = inner.state.lock().unwrap();
                    st.error.is_some() && st.throw_on_error
                };

                let result = if cancelled {
                    // drop the closure before the pending count goes down,
                    // so wait() implies every task is gone
                    drop(task);
                    Ok(())
                } else {
                    match panic::catch_unwind(AssertUnwindSafe(task)) {
                        Ok(res) => res,
                        Err(_) => Err(format_err!("executor task panicked")),
                    }
                };

                let mut st = inner.state.lock().unwrap();
                st.pending -= 1;
                if let Err(e) = result {
                    if st.error.is_none() {
                        st.error = Some(e);
                    }
                }
                if st.pending == 0 {
                    inner.done.notify_all();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_tasks() {
        let ex = Executor::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let count = count.clone();
            ex.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        ex.wait().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn tasks_can_submit_tasks() {
        let ex = Executor::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        let handle = ex.clone();
        let c = count.clone();
        ex.submit(move || {
            for _ in 0..8 {
                let c = c.clone();
                handle.submit(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
            Ok(())
        });
        ex.wait().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn first_error_is_reraised_and_queue_cancelled() {
        let ex = Executor::new(1);
        ex.set_throw_on_error(true);
        let ran_after = Arc::new(AtomicUsize::new(0));
        ex.submit(|| Err(format_err!("boom")));
        let ran = ran_after.clone();
        ex.submit(move || {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let err = ex.wait().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);

        // reusable after a failed wait
        ex.submit(|| Ok(()));
        ex.wait().unwrap();
    }

    #[test]
    fn errors_ignored_without_throw() {
        let ex = Executor::new(2);
        ex.submit(|| Err(format_err!("swallowed")));
        ex.wait().unwrap();
    }
}
