use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use dialoguer::{Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vid2gif::request::{ALLOWED_COLORS, ALLOWED_FPS, WIDTH_PRESETS};
use vid2gif::{
    unique_output_path, with_gif_extension, AppConfig, ConversionRequest, ConvertError, DitherMethod, Event, GifConverter,
    QualityPreset, RunOutcome, Settings, Terminal,
};

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_NEEDS_CONFIRMATION: i32 = 3;

#[derive(Parser, Debug)]
#[command(version, about = "Convert video clips into animated GIFs with size and frame limits.")]
struct Args {
    #[command(subcommand)]
    cmd: Command,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Read configuration from this file instead of the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a video clip to a GIF
    Convert(ConvertArgs),
    /// Predict frame count and size without encoding
    Estimate(EstimateArgs),
    /// Show duration and resolution of a video
    Probe {
        input: PathBuf,
        /// Print JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show or change saved preferences
    Settings {
        /// Directory new GIFs are written to
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Ask for the save location on every conversion
        #[arg(long)]
        ask_save_location: Option<bool>,
    },
}

#[derive(ClapArgs, Debug)]
struct ClipArgs {
    /// Start time in seconds
    #[arg(long)]
    start: Option<f64>,

    /// Clip length in seconds (0 converts to the end of the video)
    #[arg(long)]
    duration: Option<f64>,

    /// Output frame rate (10, 15, 20 or 25)
    #[arg(long, value_parser = parse_fps)]
    fps: Option<u32>,

    /// Output width in pixels; height keeps the aspect ratio
    #[arg(long, long_help = width_help())]
    width: Option<u32>,

    /// Quality preset
    #[arg(long)]
    quality: Option<QualityPreset>,

    /// Palette size (128, 192 or 256)
    #[arg(long, value_parser = parse_colors)]
    colors: Option<u16>,
}

#[derive(ClapArgs, Debug)]
struct ConvertArgs {
    /// Input video file
    input: PathBuf,

    /// Output GIF path (defaults to the saved output directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(flatten)]
    clip: ClipArgs,

    /// Exact encode quality level, 1 (smallest) to 6 (best)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=6), conflicts_with = "quality")]
    quality_level: Option<u8>,

    /// Dithering method (bayer, floyd_steinberg or sierra2_4a)
    #[arg(long)]
    dither: Option<DitherMethod>,

    /// Skip the frame-count and size limits
    #[arg(long, default_value_t = false)]
    ignore_limits: bool,

    /// Print events as JSON lines on stdout
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Never prompt; runs needing confirmation exit with status 3
    #[arg(long, default_value_t = false)]
    no_input: bool,
}

#[derive(ClapArgs, Debug)]
struct EstimateArgs {
    /// Video to take duration and aspect ratio from
    input: Option<PathBuf>,

    #[command(flatten)]
    clip: ClipArgs,

    /// Print JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn parse_fps(s: &str) -> Result<u32, String> {
    let fps: u32 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if !ALLOWED_FPS.contains(&fps) {
        return Err(format!("fps must be one of {:?}", ALLOWED_FPS));
    }
    Ok(fps)
}

fn width_help() -> String {
    let presets: Vec<String> = WIDTH_PRESETS.iter().map(|w| w.to_string()).collect();
    format!(
        "Output width in pixels; height keeps the aspect ratio.\nAny positive width works; common choices: {}",
        presets.join(", ")
    )
}

fn parse_colors(s: &str) -> Result<u16, String> {
    let colors: u16 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if !ALLOWED_COLORS.contains(&colors) {
        return Err(format!("colors must be one of {:?}", ALLOWED_COLORS));
    }
    Ok(colors)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("vid2gif={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(p) => AppConfig::from_file(p),
        None => AppConfig::load(),
    }
}

fn settings_path() -> Result<PathBuf> {
    Settings::default_path().ok_or_else(|| anyhow!("no config directory available for settings"))
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FAILED
        }
    };
    process::exit(code);
}

fn run(args: Args) -> Result<i32> {
    let cfg = load_config(args.config.as_deref())?;
    let converter = GifConverter::with_config(cfg)?;

    match args.cmd {
        Command::Convert(c) => run_convert(&converter, c),
        Command::Estimate(e) => run_estimate(&converter, e),
        Command::Probe { input, json } => run_probe(&converter, &input, json),
        Command::Settings { output_dir, ask_save_location } => run_settings(output_dir, ask_save_location),
    }
}

fn build_request(converter: &GifConverter, args: &ConvertArgs, output: PathBuf) -> ConversionRequest {
    let mut req = converter.request(&args.input, output);
    let clip = &args.clip;
    if let Some(start) = clip.start {
        req = req.with_start(start);
    }
    if let Some(duration) = clip.duration {
        req = req.with_duration(duration);
    }
    if let Some(fps) = clip.fps {
        req = req.with_fps(fps);
    }
    if let Some(width) = clip.width {
        req = req.with_width(width);
    }
    if let Some(preset) = clip.quality {
        req = req.with_quality_preset(preset);
    }
    if let Some(level) = args.quality_level {
        req = req.with_quality(level);
    }
    if let Some(dither) = args.dither {
        req = req.with_dither(dither);
    }
    if let Some(colors) = clip.colors {
        req = req.with_colors(colors);
    }
    req.with_ignore_limits(args.ignore_limits)
}

fn resolve_output(explicit: Option<&Path>, input: &Path, interactive: bool) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(with_gif_extension(p.to_path_buf()));
    }
    let settings = match Settings::default_path() {
        Some(p) => Settings::load_from(&p)?,
        None => Settings::default(),
    };
    let suggested = unique_output_path(&settings.output_dir, input);
    if interactive && settings.ask_save_location {
        let chosen: String = Input::new()
            .with_prompt("Save GIF as")
            .default(suggested.display().to_string())
            .interact_text()?;
        return Ok(with_gif_extension(PathBuf::from(chosen)));
    }
    Ok(suggested)
}

enum SizeChoice {
    Keep,
    Rerun,
    Discard,
}

fn ask_size_override(outcome: &RunOutcome, max_mb: f64) -> Result<SizeChoice> {
    let items = ["Keep it", "Encode again ignoring limits", "Delete it"];
    let selection = Select::new()
        .with_prompt(format!(
            "{} is {:.2} MB, over the {} MB limit",
            outcome.output.display(),
            outcome.size_mb,
            max_mb
        ))
        .default(0)
        .items(&items)
        .interact()?;
    Ok(match selection {
        0 => SizeChoice::Keep,
        1 => SizeChoice::Rerun,
        _ => SizeChoice::Discard,
    })
}

fn run_convert(converter: &GifConverter, args: ConvertArgs) -> Result<i32> {
    let interactive = !args.no_input && !args.json && std::io::stdin().is_terminal();
    let output = resolve_output(args.output.as_deref(), &args.input, interactive)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating output dir {}", parent.display()))?;
    }

    let mut request = build_request(converter, &args, output);
    let mut session = converter.session();
    match session.select_input(&args.input) {
        Ok(_) => request = session.fit_request(request),
        Err(e) => warn!(error = %e, "could not probe input, using the requested duration as given"),
    }
    debug!(?request, "built request");
    let max_mb = converter.config().policy.max_size_mb;

    loop {
        let terminal = run_once(converter, request.clone(), args.json)?;
        match terminal {
            Terminal::Completed(outcome) => {
                if !args.json {
                    println!(
                        "GIF saved to {} ({:.2} MB, {} frames)",
                        outcome.output.display(),
                        outcome.size_mb,
                        outcome.frame_count
                    );
                }
                return Ok(EXIT_OK);
            }
            Terminal::AwaitingOverride { frame_count, max_frames } => {
                let proceed = interactive
                    && Confirm::new()
                        .with_prompt(format!(
                            "This clip has {} frames, more than the limit of {}. Convert anyway?",
                            frame_count, max_frames
                        ))
                        .default(false)
                        .interact()?;
                if !proceed {
                    if !args.json {
                        println!("Not converted: {} frames exceeds the limit of {}.", frame_count, max_frames);
                    }
                    return Ok(EXIT_NEEDS_CONFIRMATION);
                }
                info!(frame_count, "frame limit overridden");
                request = request.with_override();
            }
            Terminal::AwaitingSizeOverride(outcome) => {
                if !interactive {
                    if !args.json {
                        println!(
                            "GIF written to {} but it is {:.2} MB, over the {} MB limit.",
                            outcome.output.display(),
                            outcome.size_mb,
                            max_mb
                        );
                    }
                    return Ok(EXIT_NEEDS_CONFIRMATION);
                }
                match ask_size_override(&outcome, max_mb)? {
                    SizeChoice::Keep => {
                        println!("Kept {}", outcome.output.display());
                        return Ok(EXIT_OK);
                    }
                    SizeChoice::Rerun => request = request.with_override(),
                    SizeChoice::Discard => {
                        fs::remove_file(&outcome.output)
                            .with_context(|| format!("removing {}", outcome.output.display()))?;
                        println!("Deleted {}", outcome.output.display());
                        return Ok(EXIT_NEEDS_CONFIRMATION);
                    }
                }
            }
            Terminal::Errored(err) => {
                if !args.json {
                    report_error(&err);
                }
                return Ok(EXIT_FAILED);
            }
        }
    }
}

fn report_error(err: &ConvertError) {
    eprintln!("Conversion failed: {}. See log for details.", err);
    if let Some(diag) = err.diagnostics().map(str::trim).filter(|d| !d.is_empty()) {
        eprintln!("{}", diag);
    }
}

/// Execute one attempt, rendering its events, and hand back the terminal event
fn run_once(converter: &GifConverter, request: ConversionRequest, as_json: bool) -> Result<Terminal> {
    let pb = if as_json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {wide_msg}")
                .context("progress bar template")?
                .progress_chars("#>-"),
        );
        pb
    };

    let mut terminal = None;
    let mut write_error = None;
    converter.convert_with_events(request, |event| {
        if as_json {
            if let Err(e) = print_json_event(&event) {
                write_error.get_or_insert(e);
            }
        } else {
            match &event {
                Event::Log(line) => pb.set_message(line.clone()),
                Event::Progress(p) => pb.set_position(u64::from(*p)),
                Event::Warning(w) => pb.println(format!("warning: {}", w.message)),
                Event::Terminal(_) => {}
            }
        }
        if let Event::Terminal(t) = event {
            terminal = Some(t);
        }
    });
    pb.finish_and_clear();

    if let Some(e) = write_error {
        return Err(e);
    }
    terminal.ok_or_else(|| anyhow!("conversion ended without a result"))
}

fn event_json(event: &Event) -> Result<serde_json::Value> {
    Ok(match event {
        Event::Log(line) => json!({ "event": "log", "message": line }),
        Event::Progress(p) => json!({ "event": "progress", "percent": p }),
        Event::Warning(w) => json!({ "event": "warning", "warning": serde_json::to_value(w)? }),
        Event::Terminal(t) => {
            let mut v = json!({ "event": "terminal", "state": t.state() });
            match t {
                Terminal::Completed(o) | Terminal::AwaitingSizeOverride(o) => {
                    v["outcome"] = serde_json::to_value(o)?;
                }
                Terminal::AwaitingOverride { frame_count, max_frames } => {
                    v["frame_count"] = json!(frame_count);
                    v["max_frames"] = json!(max_frames);
                }
                Terminal::Errored(err) => {
                    v["error"] = json!({
                        "kind": err.kind(),
                        "message": err.to_string(),
                        "diagnostics": err.diagnostics(),
                    });
                }
            }
            v
        }
    })
}

fn print_json_event(event: &Event) -> Result<()> {
    let v = event_json(event)?;
    println!("{}", serde_json::to_string(&v)?);
    Ok(())
}

fn run_estimate(converter: &GifConverter, args: EstimateArgs) -> Result<i32> {
    let d = &converter.config().defaults;
    let clip = &args.clip;
    let mut session = converter.session();
    if let Some(input) = &args.input {
        session.select_input(input).with_context(|| format!("probing {}", input.display()))?;
    }

    let start = clip.start.unwrap_or(d.start);
    let requested = clip.duration.or(d.duration).filter(|v| *v > 0.0);
    let duration = session
        .clip_duration(start, requested)
        .ok_or_else(|| anyhow!("--duration is required when no input is given"))?;
    let fps = clip.fps.unwrap_or(d.fps);
    let width = clip.width.unwrap_or(d.width);
    let quality = clip.quality.unwrap_or(d.quality);
    let colors = clip.colors.unwrap_or(d.colors);

    let est = session.estimate(duration, fps, width, quality, colors);
    if args.json {
        println!("{}", serde_json::to_string(&est)?);
        return Ok(EXIT_OK);
    }

    println!("Output: {}x{} px, {} frames", est.output_width, est.output_height, est.frame_count);
    println!("Estimated size: {:.3} MB", est.estimated_size_mb);
    for v in &est.violations {
        println!("Warning: {}", v);
    }
    Ok(EXIT_OK)
}

fn run_probe(converter: &GifConverter, input: &Path, as_json: bool) -> Result<i32> {
    let mut session = converter.session();
    let meta = session.select_input(input).with_context(|| format!("probing {}", input.display()))?;
    if as_json {
        println!("{}", serde_json::to_string(&meta)?);
    } else {
        println!("{}: {:.2}s, {}x{}", input.display(), meta.duration, meta.width, meta.height);
    }
    Ok(EXIT_OK)
}

fn run_settings(output_dir: Option<PathBuf>, ask_save_location: Option<bool>) -> Result<i32> {
    let path = settings_path()?;
    let mut settings = Settings::load_from(&path)?;
    let changed = output_dir.is_some() || ask_save_location.is_some();
    if let Some(dir) = output_dir {
        settings.output_dir = dir;
    }
    if let Some(ask) = ask_save_location {
        settings.ask_save_location = ask;
    }
    if changed {
        settings.save_to(&path)?;
        info!(path = %path.display(), "settings saved");
    }
    println!("output_dir = {}", settings.output_dir.display());
    println!("ask_save_location = {}", settings.ask_save_location);
    Ok(EXIT_OK)
}
