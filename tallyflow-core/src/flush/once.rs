use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::OnceCell;

/// A blocking write-once cell which only memoizes success.
///
/// The first caller of [FlushOnce::get_or_try_init] runs the computation, concurrent callers
/// block until it finishes. If the computation fails the cell stays empty and the next caller
/// runs it again from scratch. Once it succeeded, every call returns the stored value without
/// running anything.
#[derive(Debug, Default)]
pub struct FlushOnce<T> {
    cell: OnceCell<T>,
    attempts: AtomicU32,
}

impl<T> FlushOnce<T> {
    /// Create an empty cell
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            attempts: AtomicU32::new(0),
        }
    }

    /// Get the value, computing it if no attempt succeeded yet.
    /// `f` receives the 1-based number of the attempt it runs as.
    pub fn get_or_try_init<E>(&self, f: impl FnOnce(u32) -> Result<T, E>) -> Result<&T, E> {
        self.cell.get_or_try_init(|| {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            f(attempt)
        })
    }

    /// The value, if a computation succeeded
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// How many times the computation was started
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn computes_once() {
        let cell = FlushOnce::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..5 {
            let val: Result<&i32, ()> = cell.get_or_try_init(|_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            });
            assert_eq!(val, Ok(&42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cell.attempts(), 1);
    }

    #[test]
    fn failure_is_not_memoized() {
        let cell = FlushOnce::new();
        let res = cell.get_or_try_init(|attempt| Err::<i32, _>(attempt));
        assert_eq!(res, Err(1));
        assert!(cell.get().is_none());

        let res = cell.get_or_try_init(|attempt| Ok::<_, u32>(attempt as i32 * 10));
        assert_eq!(res, Ok(&20));
        // later calls see the memoized value, not a new attempt
        let res = cell.get_or_try_init(|_| Err::<i32, _>(99));
        assert_eq!(res, Ok(&20));
        assert_eq!(cell.attempts(), 2);
    }

    /// concurrent callers block on the first computation instead of running their own
    #[test]
    fn concurrent_callers_share_result() {
        let cell = FlushOnce::new();
        let runs = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let val = cell
                        .get_or_try_init(|_| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok::<_, ()>("done")
                        })
                        .unwrap();
                    assert_eq!(*val, "done");
                });
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
