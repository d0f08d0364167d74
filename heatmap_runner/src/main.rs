use anyhow::Context;
use clap::{Parser, ValueEnum};
use motion_heatmap::{
    FfmpegBackend, HeatmapPipeline, MediaBackend, OutputSink, RawSettings, SettingKey, StatusSink,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Pipe raw frames through `ffmpeg`/`ffprobe` child processes.
    Ffmpeg,
    /// Use OpenCV's `VideoCapture` and `VideoWriter`. Needs the `opencv` feature.
    Opencv,
}

/// Generate a cumulative motion heatmap from a video.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Video to analyse.
    #[arg(required_unless_present = "list_settings")]
    input: Option<PathBuf>,

    /// Image to draw the final heatmap over.
    ///
    /// If not specified, the first frame of the input is used.
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Directory receiving the video and stills.
    #[arg(long, default_value = motion_heatmap::output_sink::DEFAULT_OUTPUT_DIR)]
    output: PathBuf,

    /// Processing parameter as `name=value`. May be repeated.
    #[arg(long = "set", value_parser = parse_key_val)]
    settings: Vec<(String, String)>,

    /// Also write the raw accumulation as `<stamp>_<suffix>_acc.jpg`.
    #[arg(long)]
    dump_accumulation: bool,

    /// Leave the settings suffix out of still filenames.
    #[arg(long)]
    no_suffix: bool,

    #[arg(long, value_enum, default_value = "ffmpeg")]
    backend: Backend,

    /// Print the available settings and exit.
    #[arg(long)]
    list_settings: bool,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {s:?}"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

/// Prints milestones with a wall-clock prefix and keeps progress on a single
/// rewritten line.
#[derive(Default)]
struct ConsoleStatus {
    status_line_open: AtomicBool,
}

impl ConsoleStatus {
    fn close_status_line(&self) {
        if self.status_line_open.swap(false, Ordering::AcqRel) {
            eprintln!();
        }
    }
}

impl StatusSink for ConsoleStatus {
    fn log_persistent(&self, text: &str) {
        self.close_status_line();
        let stamp = chrono::Local::now().format("%H:%M:%S");
        let mut lines = text.lines();
        if let Some(first) = lines.next() {
            println!("[{stamp}] {first}");
        }
        for line in lines {
            println!("           {line}");
        }
    }

    fn log_ephemeral(&self, text: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{text}\x1b[K");
        let _ = stderr.flush();
        self.status_line_open.store(true, Ordering::Release);
    }
}

fn print_settings() {
    println!("{:<20} {:<24} {:>8}  range", "name", "label", "default");
    for key in SettingKey::ALL {
        let (min, max) = key.range();
        println!(
            "{:<20} {:<24} {:>8}  [{min}, {max}]",
            key.name(),
            key.label(),
            key.default_value()
        );
    }
}

fn media_backend(choice: Backend) -> anyhow::Result<Arc<dyn MediaBackend>> {
    match choice {
        Backend::Ffmpeg => Ok(Arc::new(FfmpegBackend::new())),
        #[cfg(feature = "opencv")]
        Backend::Opencv => Ok(Arc::new(motion_heatmap::OpenCvBackend)),
        #[cfg(not(feature = "opencv"))]
        Backend::Opencv => anyhow::bail!("built without the `opencv` feature"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if cli.list_settings {
        print_settings();
        return Ok(());
    }
    let input = cli.input.context("no input video given")?;

    let output = OutputSink::new(&cli.output)
        .with_accumulation_dump(cli.dump_accumulation)
        .with_parameter_suffix(!cli.no_suffix);
    let status = Arc::new(ConsoleStatus::default());
    let pipeline = Arc::new(
        HeatmapPipeline::new(media_backend(cli.backend)?, status.clone()).with_output(output),
    );

    pipeline
        .load_input(&input)
        .await
        .with_context(|| format!("loading {}", input.display()))?;
    if let Some(reference) = &cli.reference {
        pipeline
            .set_reference_frame(Some(reference.as_path()))
            .await
            .with_context(|| format!("loading reference {}", reference.display()))?;
    }

    let raw: RawSettings = cli.settings.into_iter().collect();
    pipeline.configure(&raw);

    let handle = pipeline.start_run()?;
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current frame");
            cancel.cancel();
        }
    });

    let report = handle.wait().await;
    status.close_status_line();

    let read = report.read.context("read stage failed")?;
    let write = report.write.context("write stage failed")?;
    tracing::info!(
        "{} of {} planned frames processed{}",
        read.frames_read,
        read.planned,
        if read.cancelled { " (cancelled)" } else { "" }
    );
    println!("video:   {}", write.video_path.display());
    println!("overlay: {}", write.image_path.display());
    if let Some(path) = &write.accumulation_path {
        println!("raw:     {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs_are_split_once() {
        assert_eq!(
            parse_key_val("intensity=5").unwrap(),
            ("intensity".to_string(), "5".to_string())
        );
        assert_eq!(
            parse_key_val(" frame_skip = 2 ").unwrap(),
            ("frame_skip".to_string(), "2".to_string())
        );
        assert!(parse_key_val("intensity").is_err());
    }

    #[test]
    fn cli_accepts_repeated_settings() {
        let cli = Cli::try_parse_from([
            "heatmap_runner",
            "clip.mp4",
            "--set",
            "intensity=3",
            "--set",
            "max_frames=10",
            "--dump-accumulation",
        ])
        .unwrap();
        assert_eq!(cli.input.as_deref(), Some(std::path::Path::new("clip.mp4")));
        assert_eq!(cli.settings.len(), 2);
        assert!(cli.dump_accumulation);
        assert_eq!(cli.output, PathBuf::from("output"));
    }

    #[test]
    fn input_is_optional_only_when_listing() {
        assert!(Cli::try_parse_from(["heatmap_runner"]).is_err());
        assert!(Cli::try_parse_from(["heatmap_runner", "--list-settings"]).is_ok());
    }
}
