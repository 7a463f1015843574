//! Pure transcoder-spec generation.
//!
//! Builds the shell command(s) the native RTC binding execs as its raw-media
//! source. Grounded in `original_source/src/vc/helpers.go`'s
//! `getMediaDescription` and `getVideoDimensions`; no part of this module
//! touches a process or the filesystem beyond a single `ffprobe` probe for
//! video dimensions.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

const SAMPLE_RATE: u32 = 96_000;
const CHANNEL_COUNT: u32 = 2;
const VIDEO_FPS: u32 = 30;
const MAX_WIDTH: u32 = 1280;
const MAX_HEIGHT: u32 = 720;
const DIMENSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://").unwrap());

/// Raw-media source description for one call to `PlayMedia`: an audio
/// command always present, and an optional video command when the caller
/// asked for video and a source could be probed.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeSpec {
    pub audio_command: String,
    pub video_command: Option<String>,
    pub sample_rate: u32,
    pub channel_count: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl TranscodeSpec {
    /// Builds the command description for `path` (a local file path or a
    /// remote URL). `extra_flags` is either a seek flag string (e.g.
    /// `-ss 70 -to 300`) or a filter flag string (e.g. `-filter:a atempo=1.5`)
    /// — classified by whether it mentions `filter:`.
    pub async fn build(path: &str, want_video: bool, extra_flags: &str) -> Self {
        let is_url = URL_REGEX.is_match(path);
        let (seek_flags, filter_flags) = classify_extra_flags(extra_flags);

        let audio_command =
            build_audio_command(path, is_url, seek_flags, filter_flags);

        if !want_video {
            return Self {
                audio_command,
                video_command: None,
                sample_rate: SAMPLE_RATE,
                channel_count: CHANNEL_COUNT,
                width: 0,
                height: 0,
                fps: 0,
            };
        }

        let (orig_width, orig_height) = probe_video_dimensions(path).await;
        let (width, height) = bounded_frame_size(orig_width, orig_height);
        let video_command =
            build_video_command(path, is_url, seek_flags, filter_flags, width, height);

        Self {
            audio_command,
            video_command: Some(video_command),
            sample_rate: SAMPLE_RATE,
            channel_count: CHANNEL_COUNT,
            width,
            height,
            fps: VIDEO_FPS,
        }
    }
}

fn classify_extra_flags(extra_flags: &str) -> (&str, &str) {
    if extra_flags.is_empty() {
        ("", "")
    } else if extra_flags.contains("filter:") {
        ("", extra_flags)
    } else {
        (extra_flags, "")
    }
}

fn reconnect_block(is_url: bool) -> &'static str {
    if is_url {
        "-reconnect 1 -reconnect_at_eof 1 -reconnect_streamed 1 -reconnect_delay_max 2 "
    } else {
        ""
    }
}

fn build_audio_command(path: &str, is_url: bool, seek_flags: &str, filter_flags: &str) -> String {
    let mut cmd = String::from("ffmpeg ");
    cmd.push_str(reconnect_block(is_url));
    if !seek_flags.is_empty() {
        cmd.push_str(seek_flags);
        cmd.push(' ');
    }
    cmd.push_str(&format!("-i \"{path}\" "));
    if !filter_flags.is_empty() {
        cmd.push_str(filter_flags);
        cmd.push(' ');
    }
    cmd.push_str(&format!(
        "-f s16le -ac {CHANNEL_COUNT} -ar {SAMPLE_RATE} -v quiet pipe:1"
    ));
    cmd
}

fn build_video_command(
    path: &str,
    is_url: bool,
    seek_flags: &str,
    filter_flags: &str,
    width: u32,
    height: u32,
) -> String {
    let mut cmd = String::from("ffmpeg ");
    cmd.push_str(reconnect_block(is_url));
    if !seek_flags.is_empty() {
        cmd.push_str(seek_flags);
        cmd.push(' ');
    }
    cmd.push_str(&format!("-i \"{path}\" "));
    if !filter_flags.is_empty() {
        cmd.push_str(filter_flags);
        cmd.push(' ');
    }
    cmd.push_str(&format!(
        "-f rawvideo -r {VIDEO_FPS} -pix_fmt yuv420p -vf scale={width}:{height} -v quiet pipe:1"
    ));
    cmd
}

/// Bounds `(orig_width, orig_height)` to fit within 1280x720, preserving
/// aspect ratio and rounding each axis down to even. A zero probe result
/// falls back to the full 1280x720 frame unchanged.
fn bounded_frame_size(orig_width: u32, orig_height: u32) -> (u32, u32) {
    if orig_width == 0 || orig_height == 0 {
        return (MAX_WIDTH, MAX_HEIGHT);
    }

    let ratio = f64::from(orig_width) / f64::from(orig_height);
    let mut new_width = orig_width.min(MAX_WIDTH);
    let mut new_height = (f64::from(new_width) / ratio).round() as u32;

    if new_height > MAX_HEIGHT {
        new_height = MAX_HEIGHT;
        new_width = (f64::from(new_height) * ratio).round() as u32;
    }

    if new_width % 2 != 0 {
        new_width -= 1;
    }
    if new_height % 2 != 0 {
        new_height -= 1;
    }

    (new_width, new_height)
}

/// `ffprobe -v error -select_streams v:0 -show_entries stream=width,height
/// -of csv=s=x:p=0 <path>`, 10 s deadline. Any failure yields `(0, 0)`, which
/// `bounded_frame_size` treats as "no probe".
async fn probe_video_dimensions(path: &str) -> (u32, u32) {
    let run = async {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=s=x:p=0",
                path,
            ])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let (w, h) = text.trim().split_once('x')?;
        let width: u32 = w.parse().ok()?;
        let height: u32 = h.parse().ok()?;
        Some((width, height))
    };

    match tokio::time::timeout(DIMENSION_PROBE_TIMEOUT, run).await {
        Ok(Some(dims)) => dims,
        _ => (0, 0),
    }
}

/// Decides whether `path` refers to an existing local file, used by the
/// seek-flag interleaving rule in `CallController::seek`.
pub fn is_local_file(path: &str) -> bool {
    !URL_REGEX.is_match(path) && Path::new(path).is_file()
}

/// Builds the seek-flag string for [`TranscodeSpec::build`]'s `extra_flags`
/// argument: `-ss <pos> -i "<path>" -to <duration>` for URLs/non-files (the
/// `-i` must be interleaved between `-ss` and `-to`), or `-ss <pos> -to
/// <duration>` for local files (where `TranscodeSpec::build` inserts `-i`
/// itself).
#[must_use]
pub fn seek_flags(path: &str, is_url_or_missing_file: bool, position: u64, duration: u64) -> String {
    if is_url_or_missing_file {
        format!("-ss {position} -i \"{path}\" -to {duration}")
    } else {
        format!("-ss {position} -to {duration}")
    }
}

/// Composes the `atempo` filter chain and video PTS multiplier for a given
/// speed, per §4.6.5: halve repeatedly while `speed > 2.0`, double
/// repeatedly while `speed < 0.5`, then one final `atempo=<remaining>`.
/// Each intermediate factor is always within `[0.5, 2.0]`.
#[must_use]
pub fn speed_filters(speed: f64) -> (String, f64) {
    let video_pts = 1.0 / speed;
    let mut filters = Vec::new();
    let mut remaining = speed;
    while remaining > 2.0 {
        filters.push("atempo=2.0".to_string());
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        filters.push("atempo=0.5".to_string());
        remaining /= 0.5;
    }
    filters.push(format!("atempo={remaining:.6}"));
    (filters.join(","), video_pts)
}

/// Builds the `-filter:v ... -filter:a ...` extra-flags string for a speed
/// change, consumed by [`TranscodeSpec::build`].
#[must_use]
pub fn speed_extra_flags(speed: f64) -> String {
    let (audio_filter, video_pts) = speed_filters(speed);
    format!("-filter:v setpts={video_pts:.6}*PTS -filter:a {audio_filter}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_frame_size_falls_back_on_zero_probe() {
        assert_eq!(bounded_frame_size(0, 0), (MAX_WIDTH, MAX_HEIGHT));
    }

    #[test]
    fn bounded_frame_size_preserves_aspect_and_is_even() {
        let (w, h) = bounded_frame_size(1920, 1080);
        assert!(w <= MAX_WIDTH && h <= MAX_HEIGHT);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
        let orig_ratio = 1920.0 / 1080.0;
        let new_ratio = f64::from(w) / f64::from(h);
        assert!((orig_ratio - new_ratio).abs() < 0.01);
    }

    #[test]
    fn bounded_frame_size_portrait_source() {
        let (w, h) = bounded_frame_size(1080, 1920);
        assert!(w <= MAX_WIDTH && h <= MAX_HEIGHT);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
    }

    #[test]
    fn speed_1_75_is_a_single_atempo() {
        let (filters, pts) = speed_filters(1.75);
        assert_eq!(filters, "atempo=1.750000");
        assert!((pts - 0.571_428_6).abs() < 1e-6);
    }

    #[test]
    fn speed_3_0_splits_into_two_atempos() {
        let (filters, _) = speed_filters(3.0);
        assert_eq!(filters, "atempo=2.0,atempo=1.500000");
    }

    #[test]
    fn speed_filter_product_matches_input_speed() {
        for tenth in 5..=40 {
            let speed = f64::from(tenth) / 10.0;
            let (filters, _) = speed_filters(speed);
            let product: f64 = filters
                .split(',')
                .map(|f| f.trim_start_matches("atempo=").parse::<f64>().unwrap())
                .product();
            assert!(
                (product - speed).abs() < 1e-6,
                "speed={speed} product={product}"
            );
            for f in filters.split(',') {
                let v: f64 = f.trim_start_matches("atempo=").parse().unwrap();
                assert!((0.5..=2.0).contains(&v), "factor {v} out of range for speed {speed}");
            }
        }
    }

    #[test]
    fn seek_flags_interleaves_input_for_urls() {
        let flags = seek_flags("https://example.com/a.mp3", true, 70, 300);
        assert_eq!(flags, "-ss 70 -i \"https://example.com/a.mp3\" -to 300");
    }

    #[test]
    fn seek_flags_omits_input_for_local_files() {
        let flags = seek_flags("/tmp/a.mp3", false, 70, 300);
        assert_eq!(flags, "-ss 70 -to 300");
    }

    #[tokio::test]
    async fn audio_only_build_has_no_video_command() {
        let spec = TranscodeSpec::build("/tmp/song.mp3", false, "").await;
        assert!(spec.video_command.is_none());
        assert!(spec.audio_command.contains("-i \"/tmp/song.mp3\""));
        assert!(spec.audio_command.contains("pipe:1"));
    }

    #[tokio::test]
    async fn url_input_gets_reconnect_flags() {
        let spec = TranscodeSpec::build("https://example.com/a.mp3", false, "").await;
        assert!(spec.audio_command.contains("-reconnect 1"));
    }

    #[tokio::test]
    async fn video_request_without_a_probeable_file_falls_back_to_max_frame() {
        let spec = TranscodeSpec::build("/nonexistent/file.mp4", true, "").await;
        let video = spec.video_command.expect("video command expected");
        assert!(video.contains(&format!("scale={MAX_WIDTH}:{MAX_HEIGHT}")));
    }
}
