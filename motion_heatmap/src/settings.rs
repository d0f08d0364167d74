// THEORY:
// `Settings` is the typed parameter bundle for one heatmap run. Users hand us raw
// strings (the GUI and the runner both collect free-form text), so parsing lives
// here, driven by a single table of `SettingKey`s that knows every parameter's
// name, default and valid range.
//
// Key architectural principles:
// 1.  **Never Fail on Input**: An empty or non-numeric value silently becomes the
//     documented default. A number outside the valid range is clamped. Neither
//     case is an error; configuration problems are recovered locally.
// 2.  **Immutable Snapshot**: The pipeline copies the `Settings` at the moment a
//     run starts, so later `configure` calls cannot disturb a run in progress.
// 3.  **Traceability**: `metadata_suffix` encodes the detection parameters into
//     output filenames so an image can be traced back to the run that made it.

use std::collections::HashMap;
use std::fmt;

/// Raw, user-entered settings keyed by parameter name.
pub type RawSettings = HashMap<String, String>;

/// The palette used to render the accumulated motion image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMap {
    /// Black through red and yellow to white.
    #[default]
    Hot,
}

/// Every tunable parameter, in the order a front end should present them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    HeatIntensity,
    FrameSkip,
    MaxFrames,
    VarianceThreshold,
    HistoryFrames,
    OutputFps,
    DetectShadows,
    ErodeIterations,
}

impl SettingKey {
    pub const ALL: [SettingKey; 8] = [
        SettingKey::HeatIntensity,
        SettingKey::VarianceThreshold,
        SettingKey::FrameSkip,
        SettingKey::MaxFrames,
        SettingKey::OutputFps,
        SettingKey::HistoryFrames,
        SettingKey::DetectShadows,
        SettingKey::ErodeIterations,
    ];

    /// Machine name used as the key in `RawSettings`.
    pub fn name(self) -> &'static str {
        match self {
            SettingKey::HeatIntensity => "intensity",
            SettingKey::FrameSkip => "frame_skip",
            SettingKey::MaxFrames => "max_frames",
            SettingKey::VarianceThreshold => "variance_threshold",
            SettingKey::HistoryFrames => "history_frames",
            SettingKey::OutputFps => "output_fps",
            SettingKey::DetectShadows => "detect_shadows",
            SettingKey::ErodeIterations => "erode_iterations",
        }
    }

    /// Human readable label, including the default.
    pub fn label(self) -> &'static str {
        match self {
            SettingKey::HeatIntensity => "Change Intensity (Default: 2)",
            SettingKey::FrameSkip => "Frameskip (Default: 0)",
            SettingKey::MaxFrames => "Stop After Frames (Default: 0)",
            SettingKey::VarianceThreshold => "Variance Sensitivity (Default: 50)",
            SettingKey::HistoryFrames => "Background History Frames (Default: 100)",
            SettingKey::OutputFps => "Output FPS (Default: 30)",
            SettingKey::DetectShadows => "Detect Shadows (Default: 0)",
            SettingKey::ErodeIterations => "Erosion Iterations (Default: 0)",
        }
    }

    pub fn default_value(self) -> u64 {
        match self {
            SettingKey::HeatIntensity => 2,
            SettingKey::FrameSkip => 0,
            SettingKey::MaxFrames => 0,
            SettingKey::VarianceThreshold => 50,
            SettingKey::HistoryFrames => 100,
            SettingKey::OutputFps => 30,
            SettingKey::DetectShadows => 0,
            SettingKey::ErodeIterations => 0,
        }
    }

    /// Inclusive valid range. Parsed values outside it are clamped.
    pub fn range(self) -> (u64, u64) {
        match self {
            SettingKey::HeatIntensity => (0, u8::MAX as u64),
            SettingKey::FrameSkip => (0, 100_000),
            SettingKey::MaxFrames => (0, u32::MAX as u64),
            SettingKey::VarianceThreshold => (1, 10_000),
            SettingKey::HistoryFrames => (1, 100_000),
            SettingKey::OutputFps => (1, 240),
            SettingKey::DetectShadows => (0, 1),
            SettingKey::ErodeIterations => (0, 50),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }

    /// Parses a raw value for this key, substituting the default for anything
    /// that is not a number.
    pub fn parse(self, raw: Option<&str>) -> u64 {
        let (min, max) = self.range();
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return self.default_value();
        };
        if self == SettingKey::DetectShadows {
            match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" => return 1,
                "false" | "no" | "off" => return 0,
                _ => {}
            }
        }
        match raw.parse::<u64>() {
            Ok(value) => value.clamp(min, max),
            Err(_) => {
                tracing::debug!(
                    "setting {} has non-numeric value {raw:?}, using default {}",
                    self.name(),
                    self.default_value()
                );
                self.default_value()
            }
        }
    }
}

/// Validated processing parameters for a heatmap run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Value added to a pixel of the accumulation each time it is seen moving.
    pub intensity: u8,
    /// Sampling stride over the input frames, always at least 1.
    pub step_size: usize,
    /// Upper bound on processed frames. Zero means no bound.
    pub max_frames: usize,
    /// Squared distance a pixel must exceed to count as foreground.
    pub variance_threshold: u32,
    /// Number of recent frames the background model adapts over.
    pub history_frames: u32,
    /// Frame rate of the output video.
    pub output_fps: u32,
    /// Number of 3x3 erosion passes applied to each foreground mask.
    pub erode_iterations: u32,
    /// Whether the background model labels shadows separately from motion.
    pub detect_shadows: bool,
    pub color_map: ColorMap,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_raw(&RawSettings::new())
    }
}

impl Settings {
    /// Builds settings from raw user input. Never fails; see `SettingKey::parse`.
    pub fn from_raw(raw: &RawSettings) -> Self {
        for name in raw.keys() {
            if SettingKey::from_name(name).is_none() {
                tracing::warn!("ignoring unknown setting {name:?}");
            }
        }
        let get = |key: SettingKey| key.parse(raw.get(key.name()).map(String::as_str));

        Self {
            intensity: get(SettingKey::HeatIntensity) as u8,
            step_size: get(SettingKey::FrameSkip) as usize + 1,
            max_frames: get(SettingKey::MaxFrames) as usize,
            variance_threshold: get(SettingKey::VarianceThreshold) as u32,
            history_frames: get(SettingKey::HistoryFrames) as u32,
            output_fps: get(SettingKey::OutputFps) as u32,
            erode_iterations: get(SettingKey::ErodeIterations) as u32,
            detect_shadows: get(SettingKey::DetectShadows) != 0,
            color_map: ColorMap::Hot,
        }
    }

    /// Convenience for building settings from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let raw: RawSettings = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_raw(&raw)
    }

    /// The user-facing frame skip this step size was derived from.
    pub fn frame_skip(&self) -> usize {
        self.step_size - 1
    }

    /// Encodes the detection parameters for use in output filenames.
    pub fn metadata_suffix(&self) -> String {
        format!(
            "hist{}_var{}_int{}_shadow{}_erode{}",
            self.history_frames,
            self.variance_threshold,
            self.intensity,
            u8::from(self.detect_shadows),
            self.erode_iterations
        )
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step={} max_frames={} intensity={} variance_threshold={} history={} fps={} shadows={} erode={}",
            self.step_size,
            self.max_frames,
            self.intensity,
            self.variance_threshold,
            self.history_frames,
            self.output_fps,
            self.detect_shadows,
            self.erode_iterations
        )
    }
}
