use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::VectorStore;

#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    pub strict_durability: bool, // true = fsync every append, false = OS buffer (faster)
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        // Single core: one runtime thread for I/O plus one for blocking search/embed work,
        // and no fsync so a write does not stall every reader.
        if cores <= 1 {
            warn!(cores, "CPU constraint detected, fsync disabled");
            Self {
                logical_cores: cores,
                worker_threads: 2,
                strict_durability: false,
            }
        } else {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                strict_durability: true,
            }
        }
    }
}

/// Starts the background compaction thread. It holds only a weak handle and exits once
/// the store is dropped.
pub fn start_compaction_thread(store: &Arc<VectorStore>, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<VectorStore> = Arc::downgrade(store);
    thread::spawn(move || {
        info!(interval_secs = interval.as_secs(), "background compaction started");
        loop {
            thread::sleep(interval);
            let Some(store) = weak.upgrade() else { break };
            match store.compact() {
                Ok(live) => info!(live, "compaction complete"),
                Err(e) => error!(error = %e, "compaction failed"),
            }
        }
        info!("background compaction stopped");
    })
}
