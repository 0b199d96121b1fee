//! Generic periodic timer thread.
//!
//! Every recurring job in the driver (presence broadcast, session tick,
//! discovery re-probes) runs on one of these instead of ad-hoc loops, so
//! cancellation behaves the same everywhere. The sleep is sliced to keep
//! `cancel` prompt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct PeriodicTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    /// Runs `task` every `period` on a named thread until cancelled. The
    /// first run happens one period after the call.
    pub fn spawn<F>(name: &str, period: Duration, mut task: F) -> PeriodicTimer
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let slice = Duration::from_millis(50);
                loop {
                    let mut waited = Duration::from_millis(0);
                    while waited < period {
                        if thread_stop.load(Ordering::SeqCst) {
                            return;
                        }
                        let nap = slice.min(period - waited);
                        std::thread::sleep(nap);
                        waited += nap;
                    }
                    if thread_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    task();
                }
            })
            .expect("spawning the timer thread");
        PeriodicTimer {
            stop,
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_repeatedly_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();
        let mut timer = PeriodicTimer::spawn("test-timer", Duration::from_millis(20), move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(150));
        timer.cancel();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {} times", fired);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), fired);
    }
}
