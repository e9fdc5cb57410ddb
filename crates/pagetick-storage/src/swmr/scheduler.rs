//! Background tick scheduler
//!
//! Calls `end_tick` every `tick_len` tenths of a second on a dedicated
//! thread. The thread holds only a weak reference to the open file and exits
//! on its own once the file is closed.

use crate::file::FileHandle;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use pagetick_common::{Error, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running tick thread
#[derive(Debug)]
pub struct TickScheduler {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TickScheduler {
    /// Start ticking `file` at its configured interval
    pub fn start(file: &FileHandle) -> Result<Self> {
        let config = file.swmr_config().ok_or(Error::NotSwmrConfigured)?;
        let interval = config.tick_interval().ok_or_else(|| {
            Error::invalid_argument("tick_len is 0, ticks must be driven manually")
        })?;

        let shared = Arc::downgrade(file.shared());
        let path = file.path().to_path_buf();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("pagetick-tick".into())
            .spawn(move || {
                info!(
                    "Tick scheduler started for {} every {:?}",
                    path.display(),
                    interval
                );
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    match shared.end_tick() {
                        Ok(report) => debug!("Scheduled tick completed at {}", report.tick_num()),
                        Err(Error::NotSwmrConfigured) => break,
                        Err(e) => warn!("Scheduled tick failed for {}: {}", path.display(), e),
                    }
                }
                info!("Tick scheduler stopped for {}", path.display());
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Check if the thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Tick scheduler thread panicked");
        }
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
