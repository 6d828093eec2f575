use log::{error, info};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SelectorConfig;
use crate::error::{BrokerError, Result};
use crate::selector::{SelectorHandle, SelectorLoop};

/// `SelectorPool` owns N selector loops, each running on a dedicated thread named `selector-{n}`.
/// Connections are spread over the loops round-robin; a connection stays on the loop it was attached to.
pub struct SelectorPool {
    allocator: SelectorAllocator,
    threads: Vec<std::thread::JoinHandle<()>>,
    stopcmd: Arc<AtomicBool>,
}

/// Cloneable round-robin view of a pool's loops, handed to acceptors.
/// It does not keep the loops alive; once the pool is closed attaches fail with `SelectorStopped`.
#[derive(Clone)]
pub struct SelectorAllocator {
    handles: Arc<[SelectorHandle]>,
    next: Arc<AtomicUsize>,
}

impl SelectorAllocator {
    pub fn allocate(&self) -> SelectorHandle {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles[n % self.handles.len()].clone()
    }
}

impl Drop for SelectorPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl SelectorPool {
    pub fn new(config: &SelectorConfig) -> Result<Self> {
        if config.selector_threads == 0 {
            return Err(BrokerError::Config(
                "selector pool needs at least one thread".to_owned(),
            ));
        }
        let stopcmd = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(config.selector_threads);
        let mut threads = Vec::with_capacity(config.selector_threads);
        let mut failure = None;
        for index in 0..config.selector_threads {
            let started = SelectorLoop::new(index, config).and_then(|(selector, handle)| {
                let stopcmd = Arc::clone(&stopcmd);
                let thread = std::thread::Builder::new()
                    .name(format!("selector-{}", index))
                    .spawn(move || selector.run(stopcmd))?;
                Ok((handle, thread))
            });
            match started {
                Ok((handle, thread)) => {
                    handles.push(handle);
                    threads.push(thread);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let me = Self {
            allocator: SelectorAllocator {
                handles: handles.into(),
                next: Arc::new(AtomicUsize::new(0)),
            },
            threads,
            stopcmd,
        };
        if let Some(err) = failure {
            // me is dropped here, stopping the loops already started.
            return Err(err);
        }
        info!("selector pool started with {} loops", me.len());
        Ok(me)
    }

    /// Pick the next loop, round-robin.
    pub fn allocate(&self) -> SelectorHandle {
        self.allocator.allocate()
    }

    pub fn allocator(&self) -> SelectorAllocator {
        self.allocator.clone()
    }

    pub fn handles(&self) -> &[SelectorHandle] {
        &self.allocator.handles
    }

    pub fn len(&self) -> usize {
        self.allocator.handles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.allocator.handles.is_empty()
    }

    /// Total listeners and connections over all loops.
    pub fn count_registrants(&self) -> usize {
        self.handles().iter().map(|h| h.count_registrants()).sum()
    }

    /// Stop every loop and join its thread. Registrants are closed by their loops on the way out.
    /// Calling it again is a no-op.
    pub fn close(&mut self) {
        self.stopcmd.store(true, Ordering::Release);
        for handle in self.handles() {
            handle.wake();
        }
        for thread in std::mem::take(&mut self.threads) {
            let name = thread.thread().name().unwrap_or("selector").to_owned();
            if thread.join().is_err() {
                error!("{} panicked", name);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pool_round_robin_and_close() {
        let config = SelectorConfig {
            selector_threads: 3,
            ..SelectorConfig::default()
        };
        let mut pool = SelectorPool::new(&config).unwrap();
        assert_eq!(pool.len(), 3);
        let picked: Vec<usize> = (0..6).map(|_| pool.allocate().index()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(pool.count_registrants(), 0);

        pool.close();
        assert!(pool.handles().iter().all(|h| !h.is_running()));
        pool.close();
    }

    #[test]
    fn test_pool_rejects_zero_threads() {
        let config = SelectorConfig {
            selector_threads: 0,
            ..SelectorConfig::default()
        };
        assert!(matches!(SelectorPool::new(&config), Err(BrokerError::Config(_))));
    }
}
