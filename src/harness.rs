use super::*;

use std::fs::File;
use std::io::BufReader;

/// Settings for one co-processing run. The percentages only decide which
/// paths are spawned; they never split the input.
#[derive(Debug, Clone)]
pub struct CoprocessingConfig {
    pub cpu_percent: u8,
    pub accel_percent: u8,
    pub workload: Workload,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub original_file_size: usize,
    pub device_generation: DeviceGeneration,
    pub chunk_size: usize,
    pub strategy: SubmissionStrategy,
    pub wait_mode: WaitMode,
    pub compression_level: u32,
    pub write_reports: bool,
}

impl Default for CoprocessingConfig {
    fn default() -> Self {
        Self {
            cpu_percent: 100,
            accel_percent: 100,
            workload: Workload::CompressDeflate,
            input_path: PathBuf::from("input.bin"),
            output_dir: PathBuf::from("."),
            original_file_size: 300 * 1024 * 1024,
            device_generation: DeviceGeneration::Gen2,
            chunk_size: GEN2_MAX_BUFFER_SIZE,
            strategy: SubmissionStrategy::Eager,
            wait_mode: WaitMode::BusyPoll,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            write_reports: true,
        }
    }
}

impl CoprocessingConfig {
    pub fn cpu_enabled(&self) -> bool {
        self.cpu_percent > 0
    }

    pub fn accel_enabled(&self) -> bool {
        self.accel_percent > 0
    }

    /// Number of worker threads, which is also the barrier size.
    pub fn participants(&self) -> usize {
        usize::from(self.cpu_enabled()) + usize::from(self.accel_enabled())
    }

    pub fn validate(&self) -> Result<(), CozipOffloadError> {
        if self.cpu_percent > 100 || self.accel_percent > 100 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "percentages must be in range 0..=100",
            ));
        }

        if self.participants() == 0 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "at least one of cpu or accelerator must be active",
            ));
        }

        if self.original_file_size == 0 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "original_file_size must be greater than 0",
            ));
        }

        if self.chunk_size == 0 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "chunk_size must be greater than 0",
            ));
        }

        if let SubmissionStrategy::Pipelined { depth: 0 } = self.strategy {
            return Err(CozipOffloadError::InvalidConfiguration(
                "num_chunks must be greater than 0",
            ));
        }

        if self.compression_level > 9 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "compression level must be in range 0..=9",
            ));
        }

        Ok(())
    }

    fn worker_name(&self, path: &str) -> String {
        format!("{path}-{}", self.workload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    /// The timed run finished but some chunks failed or did not verify.
    CompletedWithErrors {
        failed_chunks: usize,
        mismatched_chunks: usize,
    },
    /// Setup failed before the start barrier. The worker still joined both
    /// barriers.
    SetupFailed(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub name: String,
    pub outcome: WorkerOutcome,
    /// Absent when setup failed.
    pub report: Option<PhaseReport>,
    pub report_path: Option<PathBuf>,
    /// Set when the results file could not be written.
    pub report_error: Option<String>,
}

impl WorkerReport {
    fn setup_failed(name: String, error: CozipOffloadError) -> Self {
        warn!(worker = %name, %error, "worker setup failed");
        Self {
            name,
            outcome: WorkerOutcome::SetupFailed(error.to_string()),
            report: None,
            report_path: None,
            report_error: None,
        }
    }

    fn finished(name: String, outcome: WorkerOutcome, report: Option<PhaseReport>) -> Self {
        Self {
            name,
            outcome,
            report,
            report_path: None,
            report_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoprocessingRun {
    pub participants: usize,
    pub workers: Vec<WorkerReport>,
}

impl CoprocessingRun {
    pub fn worker(&self, name: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|worker| worker.name == name)
    }

    pub fn all_completed(&self) -> bool {
        self.workers.iter().all(|worker| {
            worker.outcome == WorkerOutcome::Completed && worker.report_error.is_none()
        })
    }
}

/// Runs the configured paths against the soft accelerator for the
/// configured generation.
pub fn run(config: &CoprocessingConfig) -> Result<CoprocessingRun, CozipOffloadError> {
    let accelerator = Arc::new(SoftAccelerator::with_generations(&[
        config.device_generation,
    ]));
    run_with(config, accelerator)
}

pub fn run_with(
    config: &CoprocessingConfig,
    accelerator: Arc<dyn Accelerator>,
) -> Result<CoprocessingRun, CozipOffloadError> {
    config.validate()?;
    let participants = config.participants();
    let start = Arc::new(SimpleBarrier::new(participants));
    let end = Arc::new(SimpleBarrier::new(participants));
    info!(
        participants,
        workload = %config.workload,
        cpu = config.cpu_enabled(),
        accel = config.accel_enabled(),
        "co-processing run starting"
    );

    let mut handles = Vec::new();
    if config.cpu_enabled() {
        let opts = config.clone();
        let start_ref = Arc::clone(&start);
        let end_ref = Arc::clone(&end);
        handles.push((
            config.worker_name("cpu"),
            std::thread::spawn(move || cpu_worker(&opts, &start_ref, &end_ref)),
        ));
    }
    if config.accel_enabled() {
        let opts = config.clone();
        let start_ref = Arc::clone(&start);
        let end_ref = Arc::clone(&end);
        let accel = Arc::clone(&accelerator);
        handles.push((
            config.worker_name("accel"),
            std::thread::spawn(move || accel_worker(&opts, accel.as_ref(), &start_ref, &end_ref)),
        ));
    }

    let mut workers = Vec::with_capacity(handles.len());
    // Every handle is joined; one worker's failure never hides another's
    // report.
    for (name, handle) in handles {
        let mut worker = match handle.join() {
            Ok(Ok(worker)) => worker,
            Ok(Err(error)) => {
                error!(worker = %name, %error, "worker aborted");
                WorkerReport::finished(name, WorkerOutcome::Failed(error.to_string()), None)
            }
            Err(_) => {
                error!(worker = %name, "worker thread panicked");
                WorkerReport::finished(
                    name,
                    WorkerOutcome::Failed("worker thread panicked".to_string()),
                    None,
                )
            }
        };
        if config.write_reports {
            if let Some(report) = &worker.report {
                match report.write_to_dir(&config.output_dir) {
                    Ok(path) => worker.report_path = Some(path),
                    Err(error) => {
                        warn!(worker = %worker.name, %error, "results file not written");
                        worker.report_error = Some(error.to_string());
                    }
                }
            }
        }
        info!(worker = %worker.name, outcome = ?worker.outcome, "worker finished");
        workers.push(worker);
    }

    Ok(CoprocessingRun {
        participants,
        workers,
    })
}

fn cpu_worker(
    config: &CoprocessingConfig,
    start: &SimpleBarrier,
    end: &SimpleBarrier,
) -> Result<WorkerReport, CozipOffloadError> {
    let name = config.worker_name("cpu");
    let mut pipe = cpu_pipe_for(config.workload, config.compression_level);
    let output = config.output_dir.join(format!("{name}.out"));

    if let Err(error) = pipe.init(&config.input_path, &output) {
        start.arrive_and_wait()?;
        end.arrive_and_wait()?;
        return Ok(WorkerReport::setup_failed(name, error));
    }

    start.arrive_and_wait()?;
    let started = Instant::now();
    let executed = pipe.execute();
    let cpu_end = Instant::now();
    end.arrive_and_wait()?;
    let joined = started.elapsed();

    let mut report = PhaseReport::new(name.as_str());
    report.record("overall_submission_elapsed", cpu_end - started);
    report.record("joined_submission_elapsed", joined);

    let outcome = match executed.and_then(|()| pipe.cleanup()) {
        Ok(()) => WorkerOutcome::Completed,
        Err(error) => {
            error!(worker = %name, %error, "cpu pipe failed");
            WorkerOutcome::Failed(error.to_string())
        }
    };

    Ok(WorkerReport::finished(name, outcome, Some(report)))
}

fn accel_worker(
    config: &CoprocessingConfig,
    accelerator: &dyn Accelerator,
    start: &SimpleBarrier,
    end: &SimpleBarrier,
) -> Result<WorkerReport, CozipOffloadError> {
    let name = config.worker_name("accel");

    let mut session = match open_session(config, accelerator) {
        Ok(session) => session,
        Err(error) => {
            start.arrive_and_wait()?;
            end.arrive_and_wait()?;
            return Ok(WorkerReport::setup_failed(name, error));
        }
    };

    start.arrive_and_wait()?;
    let started = Instant::now();
    let ran = session.run();
    end.arrive_and_wait()?;
    let joined = started.elapsed();

    // Harvest even after a failed run so the phases recorded so far still
    // reach the report.
    let harvested = session.finish();
    let mut report = PhaseReport::new(name.as_str());
    if let Ok(summary) = &harvested {
        for (phase, elapsed) in &summary.phases {
            report.record(*phase, *elapsed);
        }
    }
    report.record("joined_submission_elapsed", joined);

    let output = config.output_dir.join(format!("{name}.out"));
    let outcome = match (ran, harvested) {
        (Err(error), _) | (Ok(()), Err(error)) => {
            error!(worker = %name, %error, "accelerator run failed");
            WorkerOutcome::Failed(error.to_string())
        }
        (Ok(()), Ok(summary)) => match session.write_output(&output) {
            Err(error) => {
                error!(
                    worker = %name,
                    %error,
                    path = %output.display(),
                    "accelerator output not written"
                );
                WorkerOutcome::Failed(error.to_string())
            }
            Ok(_) if summary.failed == 0 && summary.mismatched == 0 => WorkerOutcome::Completed,
            Ok(_) => WorkerOutcome::CompletedWithErrors {
                failed_chunks: summary.failed,
                mismatched_chunks: summary.mismatched,
            },
        },
    };
    drop(session);

    Ok(WorkerReport::finished(name, outcome, Some(report)))
}

fn open_session(
    config: &CoprocessingConfig,
    accelerator: &dyn Accelerator,
) -> Result<OffloadSession, CozipOffloadError> {
    let kind = config
        .workload
        .task_kind()
        .ok_or(CozipOffloadError::DeviceNotFound(config.workload.name()))?;
    let mut reader = BufReader::new(File::open(&config.input_path)?);
    OffloadSession::prepare(
        accelerator,
        kind,
        &mut reader,
        OffloadOptions {
            total_size: config.original_file_size,
            chunk_size: config.chunk_size,
            strategy: config.strategy,
            wait: config.wait_mode,
            level: config.compression_level,
        },
    )
}
