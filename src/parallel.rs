//! Parallel-for over a flat or 2-D iteration space.
//!
//! Every backend calls `body` exactly once per index and never synchronizes
//! writes; callers arrange for each index to own a disjoint destination range.
//! Backends only change how indices are spread over workers, never which
//! indices run, so results match the sequential backend bit for bit.
use crate::config::{ConfigError, RuntimeConfig};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

#[derive(Debug, thiserror::Error)]
pub enum ParallelError {
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error("Worker count must be positive")]
    ZeroWorkers,
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::VariantNames,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ThreadingBackend {
    /// Fixed pool, one contiguous range per worker.
    #[default]
    Static,
    /// Fixed pool, chunking left to rayon.
    Auto,
    /// Fan out over every worker currently in the pool.
    Cooperative,
    Sequential,
}

/// Range of `work` handled by worker `ithr` out of `nthr`. Ranges are
/// contiguous, ordered, and differ in length by at most one.
pub fn splitter(work: usize, nthr: usize, ithr: usize) -> Range<usize> {
    if nthr <= 1 {
        return 0..work;
    }
    let chunk = work / nthr;
    let rem = work % nthr;
    let start = ithr * chunk + ithr.min(rem);
    let len = chunk + usize::from(ithr < rem);
    start..start + len
}

pub trait ParallelBackend: Debug + Send + Sync {
    fn kind(&self) -> ThreadingBackend;
    fn max_workers(&self) -> usize;
    fn run(&self, work: usize, body: &(dyn Fn(usize) + Sync));
}

#[derive(Debug, Default)]
pub struct SequentialBackend;

impl ParallelBackend for SequentialBackend {
    fn kind(&self) -> ThreadingBackend {
        ThreadingBackend::Sequential
    }

    fn max_workers(&self) -> usize {
        1
    }

    fn run(&self, work: usize, body: &(dyn Fn(usize) + Sync)) {
        for i in 0..work {
            body(i);
        }
    }
}

#[derive(Debug)]
pub struct StaticPoolBackend {
    pool: ThreadPool,
}

impl ParallelBackend for StaticPoolBackend {
    fn kind(&self) -> ThreadingBackend {
        ThreadingBackend::Static
    }

    fn max_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run(&self, work: usize, body: &(dyn Fn(usize) + Sync)) {
        let nthr = self.max_workers().min(work);
        if nthr <= 1 {
            SequentialBackend.run(work, body);
            return;
        }
        self.pool.scope(|scope| {
            for ithr in 0..nthr {
                scope.spawn(move |_| {
                    for i in splitter(work, nthr, ithr) {
                        body(i);
                    }
                });
            }
        });
    }
}

#[derive(Debug)]
pub struct AutoPoolBackend {
    pool: ThreadPool,
}

impl ParallelBackend for AutoPoolBackend {
    fn kind(&self) -> ThreadingBackend {
        ThreadingBackend::Auto
    }

    fn max_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run(&self, work: usize, body: &(dyn Fn(usize) + Sync)) {
        if work == 0 {
            return;
        }
        self.pool
            .install(|| (0..work).into_par_iter().for_each(|i| body(i)));
    }
}

#[derive(Debug)]
pub struct CooperativeBackend {
    pool: ThreadPool,
}

impl ParallelBackend for CooperativeBackend {
    fn kind(&self) -> ThreadingBackend {
        ThreadingBackend::Cooperative
    }

    fn max_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run(&self, work: usize, body: &(dyn Fn(usize) + Sync)) {
        if work == 0 {
            return;
        }
        self.pool.broadcast(|ctx| {
            for i in splitter(work, ctx.num_threads(), ctx.index()) {
                body(i);
            }
        });
    }
}

/// Strategy object handed to kernels at execution time.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    backend: Arc<dyn ParallelBackend>,
}

impl Dispatcher {
    pub fn sequential() -> Self {
        Self::from_backend(Arc::new(SequentialBackend))
    }

    pub fn new(kind: ThreadingBackend, num_threads: Option<usize>) -> Result<Self, ParallelError> {
        if num_threads == Some(0) {
            return Err(ParallelError::ZeroWorkers);
        }
        let build_pool = || -> Result<ThreadPool, ParallelError> {
            let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("whisper-cpu-{i}"));
            if let Some(n) = num_threads {
                builder = builder.num_threads(n);
            }
            Ok(builder.build()?)
        };
        let backend: Arc<dyn ParallelBackend> = match kind {
            ThreadingBackend::Static => Arc::new(StaticPoolBackend { pool: build_pool()? }),
            ThreadingBackend::Auto => Arc::new(AutoPoolBackend { pool: build_pool()? }),
            ThreadingBackend::Cooperative => Arc::new(CooperativeBackend { pool: build_pool()? }),
            ThreadingBackend::Sequential => Arc::new(SequentialBackend),
        };
        log::info!(
            "Created {} dispatcher with {} workers",
            kind,
            backend.max_workers()
        );
        Ok(Self { backend })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ParallelError> {
        Self::new(config.threading, config.num_threads)
    }

    pub fn from_backend(backend: Arc<dyn ParallelBackend>) -> Self {
        Self { backend }
    }

    /// Builds a dispatcher from `WHISPER_CPU_*` settings looked up through `lookup`.
    pub fn from_overrides(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ParallelError> {
        let config = RuntimeConfig::default().with_overrides(lookup)?;
        Self::from_config(&config)
    }

    /// Process-wide dispatcher built from the environment on first use.
    /// A bad setting fails every call, not just the first.
    pub fn global() -> Result<&'static Dispatcher, &'static ParallelError> {
        static GLOBAL: OnceLock<Result<Dispatcher, ParallelError>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Self::from_overrides(|name| std::env::var(name).ok()))
            .as_ref()
    }

    pub fn kind(&self) -> ThreadingBackend {
        self.backend.kind()
    }

    pub fn max_workers(&self) -> usize {
        self.backend.max_workers()
    }

    pub fn parallel_for(&self, work: usize, body: impl Fn(usize) + Sync) {
        if work == 0 {
            return;
        }
        self.backend.run(work, &body);
    }

    pub fn parallel_for2d(&self, d0: usize, d1: usize, body: impl Fn(usize, usize) + Sync) {
        if d0 == 0 || d1 == 0 {
            return;
        }
        self.backend.run(d0 * d1, &|i| body(i / d1, i % d1));
    }
}
