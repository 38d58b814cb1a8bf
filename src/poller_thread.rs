//! A background thread that periodically refreshes the rule set.

use std::sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex};
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// The refresh timer thread.
///
/// Each tick invokes the refresh closure, which returns the effective poll
/// interval to honor before the next tick (the server may have raised it).
/// Recoverable failures are retried at the next tick; unauthorized and
/// configuration failures stop the thread.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until a refresh attempt succeeds or fails fatally, then
    /// that outcome.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    pub fn start<F>(initial_interval: Duration, refresh: F) -> std::io::Result<PollerThread>
    where
        F: Fn() -> Result<Duration> + Send + 'static,
    {
        // `sync_channel` makes the sender `Sync`. Buffer size of 1 is enough:
        // a full buffer means another thread already sent a stop command.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value: Result<()>| {
                *result.0.lock().unwrap() = Some(value);
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("flipkit-poller".to_owned())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let mut interval = initial_interval;
                        loop {
                            match refresh() {
                                Ok(effective) => {
                                    interval = effective;
                                    update_result(Ok(()));
                                }
                                Err(err) if !err.is_recoverable() => {
                                    update_result(Err(err));
                                    return;
                                }
                                Err(err) => {
                                    // Transient failure; the installed rule
                                    // set keeps serving until the next tick.
                                    log::debug!(target: "flipkit", "refresh attempt failed: {err}");
                                }
                            }

                            match stop_receiver.recv_timeout(jittered(interval)) {
                                Err(RecvTimeoutError::Timeout) => {
                                    // Timed out. Loop back for another refresh.
                                }
                                Ok(()) => {
                                    log::debug!(target: "flipkit", "poller thread received stop command");
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    log::debug!(target: "flipkit", "poller thread channel disconnected");
                                    return;
                                }
                            }
                        }
                    }));

                    if outcome.is_err() {
                        update_result(Err(Error::RefreshThreadPanicked));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block until the first refresh attempt has settled.
    pub fn wait_for_rules(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::RefreshThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::RefreshThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread without waiting for it to exit.
    pub fn stop(&self) {
        // Error means the thread already exited or a stop was already sent;
        // both can be ignored.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::RefreshThreadPanicked)?;
        Ok(())
    }
}

/// Apply ±10% jitter so that many clients on the same interval don't hit the
/// server in lockstep.
fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(thread_rng().gen_range(0.9..=1.1))
}
