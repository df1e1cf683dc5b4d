use std::future::Future;
use std::time::Instant;

/// Runs a closure when dropped.
///
/// The closure runs during unwinding as well, so it must not panic.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Reports timings of a measured future when dropped.
struct MeasureGuard<'a> {
    task_name: &'a str,
    created: Instant,
    /// `None` until the future resolved.
    status: Option<&'static str>,
}

impl<'a> MeasureGuard<'a> {
    fn new(task_name: &'a str) -> Self {
        Self {
            task_name,
            created: Instant::now(),
            status: None,
        }
    }

    /// Emits `futures.wait_time`, the time the future spent waiting for its first poll.
    fn polled(&self) {
        metric!(
            timer("futures.wait_time") = self.created.elapsed(),
            "task_name" => self.task_name,
        );
    }
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        metric!(
            timer("futures.done") = self.created.elapsed(),
            "task_name" => self.task_name,
            "status" => self.status.unwrap_or("canceled"),
        );
    }
}

/// Wraps a future so that its scheduling delay and total duration are reported.
///
///  - `futures.wait_time`: time from creating the future to polling it the first time.
///  - `futures.done`: time from creating the future until it resolved or was dropped.
///
/// `futures.done` is tagged with the status `get_status` derives from the output, or with
/// `"canceled"` if the future was dropped before it resolved. The [`m`] module has status
/// helpers.
pub fn measure<'a, S, F>(
    task_name: &'a str,
    get_status: S,
    f: F,
) -> impl Future<Output = F::Output> + 'a
where
    F: 'a + Future,
    S: 'a + FnOnce(&F::Output) -> &'static str,
{
    let mut guard = MeasureGuard::new(task_name);

    async move {
        guard.polled();
        let output = f.await;
        guard.status = Some(get_status(&output));
        output
    }
}

/// Status helpers for [`measure`].
pub mod m {
    use crate::error::WorkError;

    /// Always `"ok"`.
    pub fn ok<T>(_t: &T) -> &'static str {
        "ok"
    }

    /// Tells interrupted and panicked work apart from regular failures.
    pub fn work<T>(result: &Result<T, WorkError>) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(WorkError::Interrupted) => "interrupted",
            Err(WorkError::Panicked) => "panicked",
            Err(WorkError::Failed(_)) => "failed",
        }
    }
}
