//! # Rangewatch Server
//!
//! Geofence analysis service for tracked wildlife.
//!
//! This crate wires the [`rangewatch_core`] analysis pipeline to the outside
//! world:
//! - Loads the deployment (features, subjects, analyzer configurations)
//! - Ingests observation batches and triggers analysis of the subjects they touch
//! - Debounces triggers and runs analyses on a bounded worker pool
//! - Persists results and events under the data directory
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   rangewatch-server                     │
//! │  ┌─────────────────────┐   ┌─────────────────────────┐  │
//! │  │ Poller (subsystem)  │   │ --once                  │  │
//! │  │ observation batches │   │ every active subject    │  │
//! │  └──────────┬──────────┘   └────────────┬────────────┘  │
//! │             │ trigger(subject)          │               │
//! │             ▼                           ▼               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              Scheduler (subsystem)                  ││
//! │  │  - Debounce per subject                             ││
//! │  │  - One analysis per subject at a time               ││
//! │  │  - Semaphore-bounded blocking workers               ││
//! │  └──────────────────────────┬──────────────────────────┘│
//! │                             ▼                           │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │          rangewatch_core::analyze_subject           ││
//! │  │  FileResultStore ── results/<subject>.json          ││
//! │  │  JsonlEventSink  ── events.jsonl                    ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`Session`] - Main application state container
//! - [`scheduler::AnalysisScheduler`] - Per-subject trigger handle
//! - [`storage::FileResultStore`] - Results on disk
//! - [`storage::JsonlEventSink`] - Append-only event log
//!
//! ## Example: Starting the Server
//!
//! ```rust,no_run
//! use clap::Parser;
//! use rangewatch_server::{Cli, Session};
//! use tokio_graceful_shutdown::Toplevel;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["rangewatch-server", "-c", "deployment.json"]);
//!
//!     Toplevel::new(|s| async move {
//!         let _session = Session::new(&s, args).unwrap();
//!         s.on_shutdown_requested().await;
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `-c, --config` - Deployment file
//! - `-o, --observations` - Observation batch, re-read every `--poll-secs`
//! - `--debounce-secs` - Trigger coalescing window (default: 60)
//! - `--once` - Analyze every active subject once and exit

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use clap::Parser;
use rangewatch_core::{
    AnalysisContext, Deployment, MemoryObservationStore, MemoryQuietCache, Observation,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

pub mod config;
pub mod error;
pub mod observations;
pub mod scheduler;
pub mod storage;

pub use error::ServerError;
use scheduler::{AnalysisScheduler, JobReport, SchedulerConfig};
use storage::{FileResultStore, JsonlEventSink};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Deployment file with features, subjects and analyzers
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for results and events
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// JSON array of observations to ingest
    #[arg(short, long)]
    pub observations: Option<PathBuf>,

    /// Seconds between re-reads of the observation file
    #[arg(long, default_value_t = 30)]
    pub poll_secs: u64,

    /// Seconds to coalesce triggers for the same subject
    #[arg(long, default_value_t = 60)]
    pub debounce_secs: u64,

    /// Analyses that may run at the same time
    #[arg(short, long, default_value_t = scheduler::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Analyze every active subject once and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

impl Cli {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_secs(self.debounce_secs),
            workers: self.workers,
        }
    }
}

pub struct SessionInner {
    pub args: Cli,
    pub data_dir: PathBuf,
    pub deployment: Arc<Deployment>,
    pub observations: Arc<MemoryObservationStore>,
    pub context: Arc<AnalysisContext>,
    pub scheduler: Option<AnalysisScheduler>,
}

#[derive(Clone)]
pub struct Session {
    pub inner: Arc<RwLock<SessionInner>>,
}

impl Session {
    pub fn read(
        &self,
    ) -> Result<RwLockReadGuard<'_, SessionInner>, PoisonError<RwLockReadGuard<'_, SessionInner>>>
    {
        self.inner.read()
    }

    pub fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, SessionInner>, PoisonError<RwLockWriteGuard<'_, SessionInner>>>
    {
        self.inner.write()
    }

    fn inner(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the deployment and open the stores, without starting anything
    pub fn new_base(args: Cli) -> Result<Self, ServerError> {
        let data_dir = config::data_dir(args.data_dir.as_deref())?;
        let deployment_path = config::deployment_path(args.config.as_deref())?;
        let deployment = Arc::new(config::load_deployment(&deployment_path)?);

        let observations = Arc::new(MemoryObservationStore::new());
        let context = Arc::new(AnalysisContext::new(
            deployment.clone(),
            deployment.clone(),
            observations.clone(),
            Arc::new(FileResultStore::new(&data_dir)?),
            Arc::new(JsonlEventSink::open(&data_dir)?),
            Arc::new(MemoryQuietCache::new()),
        ));

        Ok(Session {
            inner: Arc::new(RwLock::new(SessionInner {
                args,
                data_dir,
                deployment,
                observations,
                context,
                scheduler: None,
            })),
        })
    }

    /// Start the scheduler and, with an observation file, the poller
    pub fn new(subsystem: &SubsystemHandle, args: Cli) -> Result<Self, ServerError> {
        let session = Self::new_base(args)?;

        let (handle, scheduler_loop) =
            scheduler::scheduler(session.context(), session.args().scheduler_config());
        session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .scheduler = Some(handle);
        subsystem.start(SubsystemBuilder::new("Scheduler", |subsys| {
            scheduler_loop.run(subsys)
        }));

        if session.args().observations.is_some() {
            let poller = session.clone();
            subsystem.start(SubsystemBuilder::new("Poller", |subsys| {
                poller.poll_observations(subsys)
            }));
        }

        Ok(session)
    }

    pub fn args(&self) -> Cli {
        self.inner().args.clone()
    }

    pub fn context(&self) -> Arc<AnalysisContext> {
        self.inner().context.clone()
    }

    /// Active subjects in the deployment
    pub fn active_subject_ids(&self) -> Vec<String> {
        self.inner()
            .deployment
            .subjects
            .iter()
            .filter(|s| s.is_active)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Store new observations and trigger analysis of the subjects they touch
    pub fn ingest(&self, batch: Vec<Observation>) -> Result<Vec<String>, ServerError> {
        let (store, scheduler) = {
            let inner = self.inner();
            (inner.observations.clone(), inner.scheduler.clone())
        };
        let touched = observations::ingest(&store, batch);
        if let Some(scheduler) = scheduler {
            for subject_id in &touched {
                scheduler.trigger(subject_id)?;
            }
        }
        Ok(touched)
    }

    /// Read the configured observation file, if any, and ingest it
    pub fn ingest_observation_file(&self) -> Result<Vec<String>, ServerError> {
        match self.args().observations {
            Some(path) => self.ingest(observations::load_batch(&path)?),
            None => Ok(Vec::new()),
        }
    }

    /// Analyze every active subject once
    pub async fn run_once(&self) -> Vec<JobReport> {
        let workers = self.args().workers;
        scheduler::run_once(self.context(), self.active_subject_ids(), workers).await
    }

    async fn poll_observations(self, subsys: SubsystemHandle) -> Result<(), ServerError> {
        let period = Duration::from_secs(self.args().poll_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    log::info!("Poller shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    match self.ingest_observation_file() {
                        Ok(touched) if !touched.is_empty() => {
                            log::info!("New observations for {} subject(s)", touched.len());
                        }
                        Ok(_) => {}
                        Err(ServerError::Shutdown) => break,
                        Err(e) => log::warn!("Cannot ingest observations: {}", e),
                    }
                }
            }
        }
        Ok(())
    }
}
