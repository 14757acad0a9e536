use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use vid2gif::policy::frame_count;
use vid2gif::{
    estimate, CancelToken, ConversionRequest, ConvertError, Encoder, EstimateInput, Event, EventSink, Pipeline,
    Policy, PolicyViolation, Probe, QualityPreset, Result, RunState, Session, SourceMetadata, StepOutput, Terminal,
};

/// Probe returning fixed metadata, or failing for inputs named `broken.*`
struct FakeProbe {
    meta: SourceMetadata,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeProbe {
    fn new(duration: f64) -> Arc<Self> {
        Arc::new(Self {
            meta: SourceMetadata { duration, width: 1920, height: 1080 },
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Probe for FakeProbe {
    fn probe(&self, path: &Path) -> Result<SourceMetadata> {
        self.calls.lock().unwrap().push(path.to_path_buf());
        if path.file_stem().is_some_and(|s| s == "broken") {
            return Err(ConvertError::Probe { path: path.to_path_buf(), message: "Invalid data found".into() });
        }
        Ok(self.meta)
    }
}

/// Which pass of a [`FakeEncoder`] exits non-zero
#[derive(Clone, Copy, PartialEq)]
enum FailAt {
    Nowhere,
    Palette,
    Encode,
}

/// Encoder that writes its artifacts instead of running ffmpeg.
///
/// The palette pass writes a small file to its last argument; the encode pass
/// writes `output_bytes` to its last argument.
struct FakeEncoder {
    output_bytes: usize,
    fail_at: FailAt,
    /// Cancelled while the palette pass runs
    cancel_during_palette: Option<CancelToken>,
    invocations: Mutex<Vec<Vec<String>>>,
    palettes: Mutex<Vec<PathBuf>>,
}

impl FakeEncoder {
    fn build(output_bytes: usize, fail_at: FailAt, cancel_during_palette: Option<CancelToken>) -> Arc<Self> {
        Arc::new(Self {
            output_bytes,
            fail_at,
            cancel_during_palette,
            invocations: Mutex::new(Vec::new()),
            palettes: Mutex::new(Vec::new()),
        })
    }

    fn new(output_bytes: usize) -> Arc<Self> {
        Self::build(output_bytes, FailAt::Nowhere, None)
    }

    fn failing_at(fail_at: FailAt) -> Arc<Self> {
        Self::build(0, fail_at, None)
    }

    fn cancelling(token: CancelToken) -> Arc<Self> {
        Self::build(1024, FailAt::Nowhere, Some(token))
    }

    fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.lock().unwrap().clone()
    }

    fn palettes(&self) -> Vec<PathBuf> {
        self.palettes.lock().unwrap().clone()
    }
}

impl Encoder for FakeEncoder {
    fn run_step(&self, args: &[OsString], on_line: &mut dyn FnMut(&str)) -> Result<StepOutput> {
        let strings: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        self.invocations.lock().unwrap().push(strings.clone());
        let target = PathBuf::from(args.last().unwrap());

        if strings.iter().any(|a| a == "-vf") {
            fs::write(&target, b"PNG").unwrap();
            self.palettes.lock().unwrap().push(target);
            if let Some(token) = &self.cancel_during_palette {
                token.cancel();
            }
            if self.fail_at == FailAt::Palette {
                on_line("Error while filtering: Out of memory");
                return Ok(StepOutput { exit_code: Some(1), diagnostics: "Error while filtering: Out of memory\n".into() });
            }
            on_line("frame=  125 fps=0.0 q=-0.0 Lsize=N/A");
            return Ok(StepOutput { exit_code: Some(0), diagnostics: String::new() });
        }

        if self.fail_at == FailAt::Encode {
            on_line("Conversion failed!");
            return Ok(StepOutput { exit_code: Some(69), diagnostics: "Conversion failed!\n".into() });
        }
        fs::write(&target, vec![0u8; self.output_bytes]).unwrap();
        Ok(StepOutput { exit_code: Some(0), diagnostics: String::new() })
    }
}

struct Harness {
    probe: Arc<FakeProbe>,
    encoder: Arc<FakeEncoder>,
    pipeline: Arc<Pipeline<Arc<FakeProbe>, Arc<FakeEncoder>>>,
    out_dir: tempfile::TempDir,
}

impl Harness {
    fn new(probe: Arc<FakeProbe>, encoder: Arc<FakeEncoder>) -> Self {
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&probe), Arc::clone(&encoder)));
        Self { probe, encoder, pipeline, out_dir: tempfile::tempdir().unwrap() }
    }

    fn request(&self, input: &str) -> ConversionRequest {
        ConversionRequest::new(input, self.out_dir.path().join("out.gif"))
    }

    fn run(&self, request: &ConversionRequest) -> (vid2gif::RunReport, Vec<Event>) {
        self.run_with(request, &CancelToken::new())
    }

    fn run_with(&self, request: &ConversionRequest, cancel: &CancelToken) -> (vid2gif::RunReport, Vec<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let report = self.pipeline.run(request, &EventSink::new(tx), cancel);
        (report, rx.try_iter().collect())
    }
}

fn terminal(events: &[Event]) -> &Terminal {
    let terminals: Vec<&Terminal> = events
        .iter()
        .filter_map(|e| match e {
            Event::Terminal(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(terminals.len(), 1, "exactly one terminal event");
    assert!(matches!(events.last(), Some(Event::Terminal(_))), "terminal event comes last");
    terminals[0]
}

fn progress(events: &[Event]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Progress(p) => Some(*p),
            _ => None,
        })
        .collect()
}

#[test]
fn estimator_and_runner_agree_on_frame_count() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(1024));
    for &fps in &[10u32, 15, 20, 25] {
        for &duration in &[0.5, 1.0, 3.3, 7.77, 12.0, 30.0] {
            let est = estimate(&EstimateInput {
                duration,
                fps,
                width: 640,
                source: None,
                quality: QualityPreset::Medium,
                colors: 256,
            });
            assert_eq!(est.frame_count, frame_count(fps, duration));

            let req = h.request("clip.mp4").with_fps(fps).with_duration(duration);
            let (_, events) = h.run(&req);
            let runner_frames = match terminal(&events) {
                Terminal::Completed(o) => o.frame_count,
                Terminal::AwaitingOverride { frame_count, .. } => *frame_count,
                other => panic!("unexpected terminal {:?}", other),
            };
            assert_eq!(runner_frames, est.frame_count, "fps {} duration {}", fps, duration);
        }
    }
}

#[test]
fn completed_run_end_to_end() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(2 * 1024 * 1024));
    let req = h.request("clip.mp4").with_start(2.0).with_duration(5.0).with_fps(25).with_width(800).with_quality(4);
    let (report, events) = h.run(&req);

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(
        report.trace,
        vec![
            RunState::Created,
            RunState::ResolvingDuration,
            RunState::PreflightCheck,
            RunState::GeneratingPalette,
            RunState::Encoding,
            RunState::Finalizing,
            RunState::Completed,
            RunState::Terminated,
        ]
    );
    assert_eq!(progress(&events), vec![25, 50, 100]);
    assert_eq!(h.probe.calls(), 0);

    match terminal(&events) {
        Terminal::Completed(o) => {
            assert_eq!(o.frame_count, 125);
            assert_eq!(o.size_bytes, 2 * 1024 * 1024);
            assert!((o.size_mb - 2.0).abs() < 1e-9);
            assert!(o.violated.is_empty());
        }
        other => panic!("unexpected terminal {:?}", other),
    }

    let calls = h.encoder.invocations();
    assert_eq!(calls.len(), 2);
    assert_eq!(&calls[0][..7], &["-y", "-ss", "2", "-t", "5", "-i", "clip.mp4"]);
    assert!(calls[1].iter().any(|a| a.contains("paletteuse=dither=bayer:bayer_scale=2")));
    assert!(events.iter().any(|e| matches!(e, Event::Log(l) if l.starts_with("palette command: -y -ss 2"))));
    assert!(events.iter().any(|e| matches!(e, Event::Log(l) if l.contains("frame=  125"))));
}

#[test]
fn frame_limit_blocks_before_any_spawn() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(1024));
    let req = h.request("clip.mp4").with_fps(25).with_duration(15.0);
    let (report, events) = h.run(&req);

    assert_eq!(report.state, RunState::AwaitingOverride);
    assert!(!report.visited(RunState::GeneratingPalette));
    assert!(h.encoder.invocations().is_empty());
    let warnings: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Warning(w) => Some(w),
            _ => None,
        })
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].violation, PolicyViolation::FrameCountExceeded);
    assert_eq!(warnings[0].frame_count, 375);
    assert!(matches!(terminal(&events), Terminal::AwaitingOverride { frame_count: 375, max_frames: 300 }));
}

#[test]
fn override_reaches_palette_generation() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(1024));
    let first = h.request("clip.mp4").with_fps(25).with_duration(20.0);
    let (report, _) = h.run(&first);
    assert_eq!(report.state, RunState::AwaitingOverride);
    assert_eq!(report.trace.last(), Some(&RunState::Terminated));

    let second = first.with_override();
    let (report, events) = h.run(&second);
    assert!(report.visited(RunState::GeneratingPalette));
    assert_eq!(report.state, RunState::Completed);
    match terminal(&events) {
        Terminal::Completed(o) => {
            assert_eq!(o.frame_count, 500);
            assert!(o.violated.contains(&PolicyViolation::FrameCountExceeded));
        }
        other => panic!("unexpected terminal {:?}", other),
    }
    assert!(!events.iter().any(|e| matches!(e, Event::Warning(_))));
}

#[test]
fn oversized_output_awaits_size_override() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(11 * 1024 * 1024));
    let req = h.request("clip.mp4").with_duration(4.0);
    let (report, events) = h.run(&req);

    assert_eq!(report.state, RunState::AwaitingSizeOverride);
    assert!(report.visited(RunState::Finalizing));
    match terminal(&events) {
        Terminal::AwaitingSizeOverride(o) => {
            assert!(o.size_mb > 10.0);
            assert!(o.output.exists());
            assert!(o.violated.contains(&PolicyViolation::SizeExceeded));
        }
        other => panic!("unexpected terminal {:?}", other),
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Warning(w) if w.violation == PolicyViolation::SizeExceeded)));

    let (report, events) = h.run(&req.with_override());
    assert_eq!(report.state, RunState::Completed);
    assert!(matches!(terminal(&events), Terminal::Completed(_)));
    assert_eq!(h.encoder.invocations().len(), 4);
}

#[test]
fn probe_failure_never_generates_palette() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(1024));
    let req = h.request("broken.mp4");
    let (report, events) = h.run(&req);

    assert_eq!(report.state, RunState::Errored);
    assert!(!report.visited(RunState::GeneratingPalette));
    assert!(h.encoder.invocations().is_empty());
    assert!(matches!(terminal(&events), Terminal::Errored(ConvertError::Probe { .. })));
}

#[test]
fn full_duration_is_probed_from_start_offset() {
    let h = Harness::new(FakeProbe::new(10.0), FakeEncoder::new(1024));
    let req = h.request("clip.mp4").with_start(4.0).with_fps(10);
    let (report, events) = h.run(&req);

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(h.probe.calls(), 1);
    match terminal(&events) {
        Terminal::Completed(o) => assert_eq!(o.frame_count, 60),
        other => panic!("unexpected terminal {:?}", other),
    }
    assert!(h.encoder.invocations()[0].windows(2).any(|w| w[0] == "-t" && w[1] == "6"));

    let past_end = h.request("clip.mp4").with_start(12.0);
    let (report, events) = h.run(&past_end);
    assert_eq!(report.state, RunState::Errored);
    assert!(matches!(terminal(&events), Terminal::Errored(ConvertError::InvalidRequest(_))));
}

#[test]
fn working_directory_removed_for_every_terminal_state() {
    // Completed
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(1024));
    h.run(&h.request("clip.mp4").with_duration(2.0));
    // AwaitingSizeOverride
    let big = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(11 * 1024 * 1024));
    big.run(&big.request("clip.mp4").with_duration(2.0));
    // Errored during the palette pass
    let no_palette = Harness::new(FakeProbe::new(60.0), FakeEncoder::failing_at(FailAt::Palette));
    let (report, events) = no_palette.run(&no_palette.request("clip.mp4").with_duration(2.0));
    assert_eq!(report.state, RunState::Errored);
    assert!(!report.visited(RunState::Encoding));
    assert!(matches!(terminal(&events), Terminal::Errored(ConvertError::PaletteGenerationFailed { exit_code: Some(1), .. })));
    assert_eq!(no_palette.encoder.invocations().len(), 1);
    // Errored during encode
    let bad = Harness::new(FakeProbe::new(60.0), FakeEncoder::failing_at(FailAt::Encode));
    let (report, events) = bad.run(&bad.request("clip.mp4").with_duration(2.0));
    assert_eq!(report.state, RunState::Errored);
    match terminal(&events) {
        Terminal::Errored(err @ ConvertError::EncodeFailed { exit_code: Some(69), .. }) => {
            assert_eq!(err.diagnostics(), Some("Conversion failed!\n"));
        }
        other => panic!("unexpected terminal {:?}", other),
    }

    for harness in [&h, &big, &no_palette, &bad] {
        let palettes = harness.encoder.palettes();
        assert_eq!(palettes.len(), 1);
        let work_dir = palettes[0].parent().unwrap();
        assert!(!palettes[0].exists());
        assert!(!work_dir.exists(), "{} still exists", work_dir.display());
    }
}

#[test]
fn cancelled_before_start_spawns_nothing() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(1024));
    let cancel = CancelToken::new();
    cancel.cancel();

    let (report, events) = h.run_with(&h.request("clip.mp4").with_duration(2.0), &cancel);
    assert_eq!(report.state, RunState::Errored);
    assert!(matches!(terminal(&events), Terminal::Errored(ConvertError::Cancelled)));
    assert!(h.encoder.invocations().is_empty());

    let (_, events) = h.run_with(&h.request("clip.mp4"), &cancel);
    assert!(matches!(terminal(&events), Terminal::Errored(ConvertError::Cancelled)));
    assert_eq!(h.probe.calls(), 0);
}

#[test]
fn cancelled_between_passes_stops_before_encode() {
    let cancel = CancelToken::new();
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::cancelling(cancel.clone()));
    let (report, events) = h.run_with(&h.request("clip.mp4").with_duration(2.0), &cancel);

    assert_eq!(report.state, RunState::Errored);
    assert!(report.visited(RunState::GeneratingPalette));
    assert!(!report.visited(RunState::Encoding));
    assert!(matches!(terminal(&events), Terminal::Errored(ConvertError::Cancelled)));
    assert_eq!(h.encoder.invocations().len(), 1);
    assert!(!h.request("clip.mp4").output.exists());

    let palettes = h.encoder.palettes();
    assert!(!palettes[0].parent().unwrap().exists());
}

#[test]
fn session_estimate_and_run_agree_on_overlong_clip() {
    let h = Harness::new(FakeProbe::new(8.0), FakeEncoder::new(1024));
    let mut session = Session::new(Arc::clone(&h.probe), Policy::default());
    session.select_input("clip.mp4").unwrap();

    let duration = session.clip_duration(0.0, Some(15.0)).unwrap();
    let est = session.estimate(duration, 25, 800, QualityPreset::High, 256);
    assert_eq!(est.frame_count, 200);
    assert!(est.within_limits());

    let req = session.fit_request(h.request("clip.mp4").with_duration(15.0).with_fps(25));
    let (report, events) = h.run(&req);
    assert_eq!(report.state, RunState::Completed);
    match terminal(&events) {
        Terminal::Completed(o) => assert_eq!(o.frame_count, est.frame_count),
        other => panic!("unexpected terminal {:?}", other),
    }
    assert!(h.encoder.invocations()[0].windows(2).any(|w| w[0] == "-t" && w[1] == "8"));
}

#[test]
fn spawned_run_streams_events_in_order() {
    let h = Harness::new(FakeProbe::new(60.0), FakeEncoder::new(1024));
    let handle = h.pipeline.spawn(h.request("clip.mp4").with_duration(3.0));
    let events: Vec<Event> = handle.events().iter().collect();
    let report = handle.wait();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(progress(&events), vec![25, 50, 100]);
    assert!(matches!(terminal(&events), Terminal::Completed(_)));
}
