use async_trait::async_trait;
use cairn_core::config::MemoryConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub trait HeapProbe: Send + Sync {
    fn used_bytes(&self) -> u64;
}

/// Probe with an externally set reading. Hosts plug real samplers in;
/// tests drive pressure levels directly.
#[derive(Default)]
pub struct StaticProbe {
    used: AtomicU64,
}

impl StaticProbe {
    pub fn new(used: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
        }
    }

    pub fn set(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl HeapProbe for StaticProbe {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

/// A cache that can be evicted under pressure. Priority 0 is the first
/// to go; 9 survives the longest below critical.
#[async_trait]
pub trait PressureCache: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> u8;

    /// Evict everything this cache holds; returns the entry count.
    async fn evict(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Normal,
    Gc,
    Alert,
    Critical,
}

/// Samples heap usage and walks the eviction ladder: a GC hint first,
/// low-priority cache eviction at alert, everything plus queue
/// backpressure at critical.
pub struct MemoryMonitor {
    probe: Arc<dyn HeapProbe>,
    config: MemoryConfig,
    caches: Mutex<Vec<Arc<dyn PressureCache>>>,
    backpressure: Arc<AtomicBool>,
    gc_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl MemoryMonitor {
    pub fn new(
        probe: Arc<dyn HeapProbe>,
        config: MemoryConfig,
        backpressure: Arc<AtomicBool>,
    ) -> Self {
        Self {
            probe,
            config,
            caches: Mutex::new(Vec::new()),
            backpressure,
            gc_hook: None,
        }
    }

    pub fn with_gc_hook(mut self, hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.gc_hook = Some(hook);
        self
    }

    pub fn register_cache(&self, cache: Arc<dyn PressureCache>) {
        let mut caches = self.caches.lock().unwrap();
        caches.push(cache);
        caches.sort_by_key(|cache| cache.priority());
    }

    fn level_for(&self, used: u64) -> PressureLevel {
        let fraction = used as f64 / self.config.max_heap_bytes.max(1) as f64;
        if fraction >= self.config.critical_threshold {
            PressureLevel::Critical
        } else if fraction >= self.config.alert_threshold {
            PressureLevel::Alert
        } else if fraction >= self.config.gc_threshold {
            PressureLevel::Gc
        } else {
            PressureLevel::Normal
        }
    }

    /// One sampling step; the run loop calls this on its interval.
    pub async fn sample_once(&self) -> PressureLevel {
        let used = self.probe.used_bytes();
        let level = self.level_for(used);

        match level {
            PressureLevel::Critical => {
                warn!(used, "critical memory pressure: evicting all registered caches");
                self.evict_up_to(u8::MAX).await;
                self.backpressure.store(true, Ordering::SeqCst);
            }
            PressureLevel::Alert => {
                warn!(used, "memory alert: evicting low-priority caches");
                self.evict_up_to(self.config.alert_evict_priority).await;
                self.backpressure.store(false, Ordering::SeqCst);
            }
            PressureLevel::Gc => {
                if let Some(hook) = &self.gc_hook {
                    hook();
                }
                self.backpressure.store(false, Ordering::SeqCst);
            }
            PressureLevel::Normal => {
                self.backpressure.store(false, Ordering::SeqCst);
            }
        }
        level
    }

    /// Ladder-ordered eviction: lowest priority first.
    async fn evict_up_to(&self, max_priority: u8) {
        let targets: Vec<Arc<dyn PressureCache>> = {
            let caches = self.caches.lock().unwrap();
            caches
                .iter()
                .filter(|cache| cache.priority() <= max_priority)
                .cloned()
                .collect()
        };
        for cache in targets {
            let evicted = cache.evict().await;
            info!(cache = cache.name(), evicted, "evicted cache under pressure");
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                self.sample_once().await;
                tokio::time::sleep(interval).await;
            }
        })
    }
}
