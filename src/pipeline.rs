//! Two-pass conversion state machine.
//!
//! A run walks `Created → ResolvingDuration → PreflightCheck →
//! GeneratingPalette → Encoding → Finalizing → Completed`, stopping early at
//! `AwaitingOverride` when the clip has too many frames or finishing in
//! `AwaitingSizeOverride` when the GIF is over the size limit. Any failure
//! moves to `Errored`. Every run ends in `Terminated` after its working
//! directory has been removed.
//!
//! Runs never resume. To go past a limit the caller starts a new run with
//! [`ConversionRequest::with_override`].

use crate::error::{ConvertError, Result};
use crate::ffmpeg::{Encoder, Probe};
use crate::plan::{build_plan, PlanStep, StepKind};
use crate::policy::{self, Policy, PolicyViolation, Violations};
use crate::request::ConversionRequest;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Progress reported when the palette pass starts
pub const PROGRESS_PALETTE: u8 = 25;
/// Progress reported when the encode pass starts
pub const PROGRESS_ENCODE: u8 = 50;
/// Progress reported once the output has been measured
pub const PROGRESS_DONE: u8 = 100;

const WORK_DIR_PREFIX: &str = "vid2gif-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Created,
    ResolvingDuration,
    PreflightCheck,
    AwaitingOverride,
    GeneratingPalette,
    Encoding,
    Finalizing,
    Completed,
    AwaitingSizeOverride,
    Errored,
    Terminated,
}

/// Limit hit during a run, reported before the matching terminal event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyWarning {
    pub violation: PolicyViolation,
    pub frame_count: u64,
    /// Measured output size, for size violations
    pub size_mb: Option<f64>,
    pub message: String,
}

/// What a finished encode produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub output: PathBuf,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub frame_count: u64,
    /// Limits the output breaks, whether or not they were ignored
    pub violated: Violations,
}

/// Last event of every run
#[derive(Debug)]
pub enum Terminal {
    Completed(RunOutcome),
    /// Too many frames; nothing was encoded
    AwaitingOverride { frame_count: u64, max_frames: u64 },
    /// Output written but over the size limit
    AwaitingSizeOverride(RunOutcome),
    Errored(ConvertError),
}

impl Terminal {
    pub fn state(&self) -> RunState {
        match self {
            Self::Completed(_) => RunState::Completed,
            Self::AwaitingOverride { .. } => RunState::AwaitingOverride,
            Self::AwaitingSizeOverride(_) => RunState::AwaitingSizeOverride,
            Self::Errored(_) => RunState::Errored,
        }
    }

    /// The caller has to confirm before a new run may ignore the limits
    pub fn needs_confirmation(&self) -> bool {
        matches!(self, Self::AwaitingOverride { .. } | Self::AwaitingSizeOverride(_))
    }
}

#[derive(Debug)]
pub enum Event {
    /// Pipeline message or one line of tool diagnostics
    Log(String),
    /// Milestone percentage
    Progress(u8),
    Warning(PolicyWarning),
    Terminal(Terminal),
}

/// Sending half of a run's event stream
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    sender: Option<Sender<Event>>,
}

impl EventSink {
    pub fn new(sender: Sender<Event>) -> Self {
        Self { sender: Some(sender) }
    }

    /// Sink that drops every event
    pub fn dummy() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, event: Event) {
        if let Some(ref tx) = self.sender {
            let _ = tx.send(event); // receiver may be gone
        }
    }
}

/// Shared flag checked before probing, before each tool launch and between the two passes
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        Ok(())
    }
}

/// Summary returned once a run has terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// State the run stopped in: Completed, AwaitingOverride, AwaitingSizeOverride or Errored
    pub state: RunState,
    /// Every state visited, ending with Terminated
    pub trace: Vec<RunState>,
}

impl RunReport {
    pub fn visited(&self, state: RunState) -> bool {
        self.trace.contains(&state)
    }
}

struct Run<'a> {
    state: RunState,
    trace: Vec<RunState>,
    events: &'a EventSink,
}

impl<'a> Run<'a> {
    fn new(events: &'a EventSink) -> Self {
        Self {
            state: RunState::Created,
            trace: vec![RunState::Created],
            events,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
        self.trace.push(next);
    }

    fn log(&self, message: impl Into<String>) {
        self.events.emit(Event::Log(message.into()));
    }

    fn progress(&self, percent: u8) {
        self.events.emit(Event::Progress(percent));
    }

    fn warn(&self, warning: PolicyWarning) {
        warn!(violation = ?warning.violation, frame_count = warning.frame_count, size_mb = ?warning.size_mb, "{}", warning.message);
        self.events.emit(Event::Warning(warning));
    }
}

/// Executes conversion requests against a probe and an encoder
pub struct Pipeline<P, E> {
    probe: P,
    encoder: E,
    policy: Policy,
}

impl<P: Probe, E: Encoder> Pipeline<P, E> {
    pub fn new(probe: P, encoder: E) -> Self {
        Self::with_policy(probe, encoder, Policy::default())
    }

    pub fn with_policy(probe: P, encoder: E, policy: Policy) -> Self {
        Self { probe, encoder, policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Run one request to completion on the current thread.
    ///
    /// Emits log and progress events while running and exactly one
    /// [`Event::Terminal`] at the end. The working directory is gone by the
    /// time the terminal event is sent.
    pub fn run(&self, request: &ConversionRequest, events: &EventSink, cancel: &CancelToken) -> RunReport {
        let mut run = Run::new(events);
        info!(input = %request.input.display(), attempt = request.attempt, ignore_limits = request.ignore_limits, "starting conversion");

        let terminal = match self.execute(request, &mut run, cancel) {
            Ok(terminal) => terminal,
            Err(err) => {
                run.enter(RunState::Errored);
                warn!(error = %err, "conversion failed");
                run.log(format!("error: {}", err));
                Terminal::Errored(err)
            }
        };

        let state = terminal.state();
        run.enter(RunState::Terminated);
        events.emit(Event::Terminal(terminal));
        RunReport { state, trace: run.trace }
    }

    fn execute(&self, request: &ConversionRequest, run: &mut Run<'_>, cancel: &CancelToken) -> Result<Terminal> {
        request.validate()?;

        run.enter(RunState::ResolvingDuration);
        let duration = match request.requested_duration() {
            Some(d) => d,
            None => {
                cancel.check()?;
                let meta = self.probe.probe(&request.input)?;
                let remaining = meta.duration - request.start;
                if remaining <= 0.0 {
                    return Err(ConvertError::invalid(format!(
                        "start time {}s is past the end of the source ({}s)",
                        request.start, meta.duration
                    )));
                }
                remaining
            }
        };

        run.enter(RunState::PreflightCheck);
        let frame_count = policy::frame_count(request.fps, duration);
        if self.policy.frames_exceeded(frame_count) && !request.ignore_limits {
            run.enter(RunState::AwaitingOverride);
            run.warn(PolicyWarning {
                violation: PolicyViolation::FrameCountExceeded,
                frame_count,
                size_mb: None,
                message: format!("{} frames exceeds the {} frame limit", frame_count, self.policy.max_frames),
            });
            return Ok(Terminal::AwaitingOverride { frame_count, max_frames: self.policy.max_frames });
        }

        run.enter(RunState::GeneratingPalette);
        let work_dir = tempfile::Builder::new()
            .prefix(WORK_DIR_PREFIX)
            .tempdir()
            .map_err(|e| ConvertError::io("creating working directory", e))?;
        let [palette, encode] = build_plan(request, duration, work_dir.path())?;

        run.log(format!("video: {}", request.input.display()));
        run.log(format!("start: {}s, duration: {}s, frames: {}", request.start, duration, frame_count));
        run.log(format!("fps: {}, width: {}px, quality: {}", request.fps, request.width, request.quality));
        run.log(format!("dither: {}, colors: {}", request.dither, request.colors));

        self.run_step(&palette, run, cancel)?;
        run.log("palette generated, encoding GIF");

        cancel.check()?;
        run.enter(RunState::Encoding);
        self.run_step(&encode, run, cancel)?;

        run.enter(RunState::Finalizing);
        let size_bytes = fs::metadata(&request.output)
            .map_err(|e| ConvertError::io(format!("reading size of {}", request.output.display()), e))?
            .len();
        let size_mb = policy::bytes_to_mb(size_bytes);
        run.log(format!("finished: {}, {:.2} MB, {} frames", request.output.display(), size_mb, frame_count));
        run.progress(PROGRESS_DONE);

        if let Err(e) = work_dir.close() {
            warn!(error = %e, "failed to remove working directory");
        }

        let outcome = RunOutcome {
            output: request.output.clone(),
            size_bytes,
            size_mb,
            frame_count,
            violated: self.policy.violations(frame_count, size_mb),
        };

        if self.policy.size_exceeded(size_mb) && !request.ignore_limits {
            run.enter(RunState::AwaitingSizeOverride);
            run.warn(PolicyWarning {
                violation: PolicyViolation::SizeExceeded,
                frame_count,
                size_mb: Some(size_mb),
                message: format!("{:.2} MB exceeds the {} MB size limit", size_mb, self.policy.max_size_mb),
            });
            return Ok(Terminal::AwaitingSizeOverride(outcome));
        }

        run.enter(RunState::Completed);
        info!(output = %outcome.output.display(), size_mb, frame_count, "conversion complete");
        Ok(Terminal::Completed(outcome))
    }

    fn run_step(&self, step: &PlanStep, run: &Run<'_>, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let (label, milestone) = match step.kind {
            StepKind::Palette => ("palette", PROGRESS_PALETTE),
            StepKind::Encode => ("encode", PROGRESS_ENCODE),
        };
        run.log(format!("{} command: {}", label, step.display_args()));
        run.progress(milestone);
        info!(step = label, "running ffmpeg");

        let output = self.encoder.run_step(&step.args, &mut |line| run.log(line))?;
        if output.success() {
            return Ok(());
        }
        Err(match step.kind {
            StepKind::Palette => ConvertError::PaletteGenerationFailed { exit_code: output.exit_code, diagnostics: output.diagnostics },
            StepKind::Encode => ConvertError::EncodeFailed { exit_code: output.exit_code, diagnostics: output.diagnostics },
        })
    }
}

/// A run executing on its own thread
pub struct RunHandle {
    events: Receiver<Event>,
    cancel: CancelToken,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Events in emission order; the stream closes after the terminal event
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until the run thread exits
    pub fn wait(self) -> RunReport {
        match self.join.join() {
            Ok(report) => report,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl<P, E> Pipeline<P, E>
where
    P: Probe + 'static,
    E: Encoder + 'static,
{
    /// Start a run on a new thread and return its event stream
    pub fn spawn(self: &Arc<Self>, request: ConversionRequest) -> RunHandle {
        let (tx, rx) = crossbeam_channel::unbounded();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let pipeline = Arc::clone(self);
        let join = thread::spawn(move || pipeline.run(&request, &EventSink::new(tx), &token));
        RunHandle { events: rx, cancel, join }
    }
}
