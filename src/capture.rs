//! Frame Extractor.
//!
//! Decodes the first and last frame of each source clip with FFmpeg and
//! writes them as JPEG stills into the original-frame namespaces.
//!
//! The last frame is found by seeking to `frame_count - 1`. Containers with
//! a variable frame rate or a wrong frame count in their header can make
//! that seek land short of the true final frame, or fail outright. That is
//! a known accuracy limit and is reported rather than worked around.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context};
use ffmpeg::util::frame::video::Video;
use ffmpeg::{codec, decoder, format, media, rescale, software, Rational, Rescale};
use ffmpeg_next::{self as ffmpeg};
use futures::stream::{self, StreamExt};
use image::codecs::jpeg;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::fs_utils;
use crate::layout::Layout;
use crate::models::{Dimensions, FrameRecord, Role, VideoAsset};
use crate::naming;
use crate::report::{BatchReport, UnitFailure, UnitOutcome};

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv"];

const JPEG_QUALITY: u8 = 95;

static INIT: OnceLock<Result<(), ffmpeg::Error>> = OnceLock::new();

pub fn init() -> anyhow::Result<()> {
    (*INIT.get_or_init(|| {
        let result = ffmpeg::init();
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        result
    }))
    .context("Failed to initialize FFmpeg")
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Finds source clips: a single video file, or every video under a
/// directory (recursively), sorted by path.
pub fn discover_videos(source: &Path) -> PipelineResult<Vec<PathBuf>> {
    fs_utils::walk_files(source, is_video)
}

struct OpenedStream {
    input: format::context::Input,
    stream_index: usize,
    time_base: Rational,
    frame_rate: Rational,
    start_time: i64,
    declared_frames: i64,
    duration: i64,
    decoder: decoder::Video,
}

fn open_stream(path: &Path) -> anyhow::Result<OpenedStream> {
    let input = format::input(&path).context("Failed to open video file")?;
    let stream = input
        .streams()
        .best(media::Type::Video)
        .ok_or(anyhow!(ffmpeg::Error::StreamNotFound))?;
    let stream_index = stream.index();
    let time_base = stream.time_base();
    let frame_rate = stream.avg_frame_rate();
    let start_time = stream.start_time();
    let declared_frames = stream.frames();
    let duration = stream.duration();
    let decoder = codec::context::Context::from_parameters(stream.parameters())
        .context("Failed to create codec context")?
        .decoder()
        .video()
        .context("Failed to create video decoder")?;

    Ok(OpenedStream {
        input,
        stream_index,
        time_base,
        frame_rate,
        start_time,
        declared_frames,
        duration,
        decoder,
    })
}

/// Opens a clip and reads its identity and frame size.
pub fn inspect(path: &Path) -> anyhow::Result<VideoAsset> {
    let asset_id = naming::asset_id(path).ok_or(anyhow!("Invalid path"))?;
    let opened = open_stream(path)?;
    Ok(VideoAsset {
        asset_id,
        path: path.to_path_buf(),
        frame_size: Dimensions::new(opened.decoder.width(), opened.decoder.height()),
    })
}

fn to_rgb_image(decoded: &Video) -> anyhow::Result<RgbImage> {
    let mut scaler = software::scaling::context::Context::get(
        decoded.format(),
        decoded.width(),
        decoded.height(),
        format::Pixel::RGB24,
        decoded.width(),
        decoded.height(),
        software::scaling::Flags::BILINEAR,
    )
    .context("Failed to create scaler")?;
    let mut rgb = Video::empty();
    scaler.run(decoded, &mut rgb).context("Failed to scale frame")?;

    // Rows are padded to the line stride; copy only the pixels.
    let width = rgb.width() as usize;
    let height = rgb.height() as usize;
    let stride = rgb.stride(0);
    let data = rgb.data(0);
    let mut pixels = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + width * 3]);
    }
    RgbImage::from_raw(rgb.width(), rgb.height(), pixels)
        .ok_or(anyhow!("Failed to create image buffer"))
}

/// Feeds packets until `accept` takes a decoded frame, then flushes.
fn decode_until<F>(opened: &mut OpenedStream, mut accept: F) -> anyhow::Result<Option<Video>>
where
    F: FnMut(&Video) -> bool,
{
    let mut decoded = Video::empty();
    for (stream, packet) in opened.input.packets() {
        if stream.index() != opened.stream_index {
            continue;
        }
        opened.decoder.send_packet(&packet)?;
        while opened.decoder.receive_frame(&mut decoded).is_ok() {
            if accept(&decoded) {
                return Ok(Some(decoded));
            }
        }
    }
    opened.decoder.send_eof()?;
    while opened.decoder.receive_frame(&mut decoded).is_ok() {
        if accept(&decoded) {
            return Ok(Some(decoded));
        }
    }
    Ok(None)
}

fn first_frame(path: &Path) -> anyhow::Result<RgbImage> {
    let mut opened = open_stream(path)?;
    let frame = decode_until(&mut opened, |_| true)?
        .ok_or(anyhow!("video has no decodable frames"))?;
    to_rgb_image(&frame)
}

/// Frame count as the container reports it, falling back to
/// duration times average frame rate when the header has no count.
fn reported_frame_count(opened: &OpenedStream) -> i64 {
    if opened.declared_frames > 0 {
        return opened.declared_frames;
    }
    let fps = opened.frame_rate;
    if opened.duration <= 0 || fps.numerator() <= 0 || fps.denominator() <= 0 {
        return 0;
    }
    let seconds = opened.duration as f64 * f64::from(opened.time_base);
    (seconds * f64::from(fps)).round() as i64
}

fn last_frame(path: &Path) -> anyhow::Result<RgbImage> {
    let mut opened = open_stream(path)?;
    let total = reported_frame_count(&opened);
    if total <= 0 {
        return Err(anyhow!("container reports zero frames"));
    }
    let fps = opened.frame_rate;
    if fps.numerator() <= 0 || fps.denominator() <= 0 {
        return Err(anyhow!("container reports no frame rate"));
    }

    let index = total - 1;
    let frame_period = fps.invert();
    let offset = if opened.start_time == ffmpeg::ffi::AV_NOPTS_VALUE {
        0
    } else {
        opened.start_time
    };
    let target_pts = offset + index.rescale(frame_period, opened.time_base);
    // Half a frame of slack for timestamp rounding in the container.
    let slack = 1i64.rescale(frame_period, opened.time_base) / 2;

    let seek_to = index.rescale(frame_period, rescale::TIME_BASE);
    opened
        .input
        .seek(seek_to, ..seek_to)
        .with_context(|| format!("Failed to seek to frame {index}"))?;

    let frame = decode_until(&mut opened, |decoded| {
        decoded
            .timestamp()
            .map(|pts| pts >= target_pts - slack)
            .unwrap_or(false)
    })?
    .ok_or(anyhow!("no frame decoded at index {index} of {total}"))?;
    to_rgb_image(&frame)
}

fn write_jpeg(image: &RgbImage, path: &Path) -> anyhow::Result<()> {
    let mut jpeg_data = Vec::new();
    let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, JPEG_QUALITY);
    encoder.encode(
        image,
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    fs_utils::write_atomic_blocking(path, &jpeg_data)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Extracts and writes both frames of one clip.
///
/// Both frames are decoded before either is written, so a clip whose last
/// frame cannot be reached leaves nothing behind. Re-running overwrites the
/// previous stills.
pub fn extract_asset(
    path: &Path,
    layout: &Layout,
) -> anyhow::Result<(FrameRecord, FrameRecord)> {
    init()?;
    let asset = inspect(path)?;

    let first_image = first_frame(path).context("first frame")?;
    let last_image = last_frame(path).context("last frame")?;

    let write = |role: Role, image: &RgbImage| -> anyhow::Result<FrameRecord> {
        let out = layout
            .original(role)
            .join(naming::original_frame_name(&asset.asset_id, role));
        write_jpeg(image, &out)?;
        Ok(FrameRecord {
            asset_id: asset.asset_id.clone(),
            role,
            path: out,
            size: image.dimensions().into(),
        })
    };
    let first = write(Role::First, &first_image)?;
    let last = write(Role::Last, &last_image)?;

    if first.size != last.size {
        warn!(
            asset_id = %asset.asset_id,
            stream = %asset.frame_size,
            first = %first.size,
            last = %last.size,
            "First and last frame sizes differ"
        );
    }
    Ok((first, last))
}

/// Runs the extractor over every clip under `source`.
///
/// Clips are independent, so up to `parallelism` decode at once on the
/// blocking pool. A clip that fails is reported and skipped; decoding it
/// again would fail the same way, so there is no retry.
pub async fn run(
    source: &Path,
    layout: &Layout,
    parallelism: usize,
) -> PipelineResult<BatchReport> {
    init().map_err(|e| PipelineError::Media(format!("{e:#}")))?;
    let videos = discover_videos(source)?;
    info!(
        count = videos.len(),
        source = %source.display(),
        "Extracting first and last frames"
    );

    // Frames are named by asset id alone, so two clips sharing a stem
    // would overwrite each other's stills.
    let (videos, duplicates) = naming::unique_asset_ids(videos);
    let mut report = BatchReport::new("extract");
    for (asset_id, path, kept) in duplicates {
        warn!(
            asset_id = %asset_id,
            path = %path.display(),
            kept = %kept.display(),
            "Duplicate asset id, clip not extracted"
        );
        report.record(UnitOutcome::Failed(UnitFailure::ExtractionFailed {
            asset_id,
            reason: format!("duplicate asset id, already taken by {}", kept.display()),
        }));
    }

    let outcomes: Vec<UnitOutcome> = stream::iter(videos)
        .map(|(asset_id, path)| {
            let layout = layout.clone();
            async move {
                let worker_path = path.clone();
                let result =
                    tokio::task::spawn_blocking(move || extract_asset(&worker_path, &layout))
                        .await
                        .map_err(anyhow::Error::from)
                        .and_then(|r| r);
                match result {
                    Ok((first, last)) => {
                        debug!(
                            asset_id = %asset_id,
                            first = %first.size,
                            last = %last.size,
                            "Frames extracted"
                        );
                        UnitOutcome::Succeeded
                    }
                    Err(e) => {
                        warn!(
                            asset_id = %asset_id,
                            path = %path.display(),
                            "Extraction failed: {e:#}"
                        );
                        UnitOutcome::Failed(UnitFailure::ExtractionFailed {
                            asset_id,
                            reason: format!("{e:#}"),
                        })
                    }
                }
            }
        })
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;

    report.extend(outcomes);
    Ok(report.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_videos_recurses_and_filters() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("cam2");
        std::fs::create_dir(&nested).unwrap();
        for name in ["b.mp4", "a.MOV", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::write(nested.join("c.mkv"), b"").unwrap();

        let videos = discover_videos(dir.path()).unwrap();
        assert_eq!(
            videos,
            vec![
                dir.path().join("a.MOV"),
                dir.path().join("b.mp4"),
                nested.join("c.mkv"),
            ]
        );
    }

    #[test]
    fn test_discover_single_file() {
        let dir = TempDir::new().unwrap();
        let clip = dir.path().join("A.mp4");
        std::fs::write(&clip, b"").unwrap();
        assert_eq!(discover_videos(&clip).unwrap(), vec![clip]);

        let text = dir.path().join("A.txt");
        std::fs::write(&text, b"").unwrap();
        assert!(matches!(
            discover_videos(&text),
            Err(PipelineError::InvalidSource(_))
        ));
        assert!(discover_videos(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_write_jpeg_keeps_dimensions() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("original_first_frames").join("A_first_frame.jpg");
        write_jpeg(&RgbImage::new(100, 60), &out).unwrap();
        assert_eq!(image::image_dimensions(&out).unwrap(), (100, 60));
    }

    #[tokio::test]
    async fn test_corrupt_clip_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("videos");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("broken.mp4"), b"definitely not a video").unwrap();
        std::fs::write(source.join("empty.mp4"), b"").unwrap();
        let layout = Layout::new(dir.path().join("out"));

        let report = run(&source, &layout, 2).await.unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 0);
        let ids: Vec<_> = report
            .failures
            .iter()
            .map(|f| match f {
                UnitFailure::ExtractionFailed { asset_id, .. } => asset_id.as_str(),
                other => panic!("unexpected failure {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["broken", "empty"]);
        assert!(!layout.original(Role::First).join("broken_first_frame.jpg").exists());
    }

    const CLIP_SIZE: (u32, u32) = (64, 48);

    /// Encodes one flat grey frame per entry of `lumas` at 25 fps, every
    /// frame a keyframe.
    fn encode_clip(path: &Path, lumas: &[u8]) {
        init().unwrap();
        let (width, height) = CLIP_SIZE;
        let time_base = Rational(1, 25);

        let mut octx = format::output(&path).unwrap();
        let codec = ffmpeg::encoder::find(codec::Id::MPEG4).unwrap();
        let global_header = octx
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .unwrap();
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(format::Pixel::YUV420P);
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(Rational(25, 1)));
        encoder.set_gop(1);
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = encoder.open_as(codec).unwrap();

        let stream_index = {
            let mut stream = octx.add_stream(codec).unwrap();
            stream.set_parameters(&encoder);
            stream.set_time_base(time_base);
            stream.index()
        };
        octx.write_header().unwrap();
        let stream_time_base = octx.stream(stream_index).unwrap().time_base();

        let drain = |encoder: &mut ffmpeg::encoder::video::Encoder,
                     octx: &mut format::context::Output| {
            let mut packet = ffmpeg::Packet::empty();
            while encoder.receive_packet(&mut packet).is_ok() {
                packet.set_stream(stream_index);
                packet.rescale_ts(time_base, stream_time_base);
                packet.write_interleaved(octx).unwrap();
            }
        };
        for (index, &luma) in lumas.iter().enumerate() {
            let mut frame = Video::new(format::Pixel::YUV420P, width, height);
            frame.data_mut(0).fill(luma);
            frame.data_mut(1).fill(128);
            frame.data_mut(2).fill(128);
            frame.set_pts(Some(index as i64));
            encoder.send_frame(&frame).unwrap();
            drain(&mut encoder, &mut octx);
        }
        encoder.send_eof().unwrap();
        drain(&mut encoder, &mut octx);
        octx.write_trailer().unwrap();
    }

    /// Grey level a limited-range luma decodes to.
    fn grey(luma: u8) -> i32 {
        ((i32::from(luma) - 16) * 255 / 219).clamp(0, 255)
    }

    fn centre_grey(path: &Path) -> i32 {
        let still = image::open(path).unwrap().to_rgb8();
        i32::from(still.get_pixel(CLIP_SIZE.0 / 2, CLIP_SIZE.1 / 2)[0])
    }

    #[test]
    fn test_extracts_true_first_and_last_frame() {
        let dir = TempDir::new().unwrap();
        let clip = dir.path().join("A.mp4");
        let lumas = [40, 80, 120, 160, 200];
        encode_clip(&clip, &lumas);
        assert_eq!(reported_frame_count(&open_stream(&clip).unwrap()), 5);

        let layout = Layout::new(dir.path().join("out"));
        let (first, last) = extract_asset(&clip, &layout).unwrap();

        assert_eq!(first.size, Dimensions::new(CLIP_SIZE.0, CLIP_SIZE.1));
        assert_eq!(first.size, last.size);
        assert_eq!(
            first.path,
            layout.original(Role::First).join("A_first_frame.jpg")
        );
        assert_eq!(last.path, layout.original(Role::Last).join("A_last_frame.jpg"));

        let first_grey = centre_grey(&first.path);
        assert!((first_grey - grey(40)).abs() <= 12, "first still {first_grey}");
        // Adjacent frames are ~47 grey levels apart, so landing one frame
        // early would fail this.
        let last_grey = centre_grey(&last.path);
        assert!((last_grey - grey(200)).abs() <= 12, "last still {last_grey}");
    }

    #[tokio::test]
    async fn test_same_stem_in_two_directories_extracts_once() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("videos");
        for cam in ["cam1", "cam2"] {
            std::fs::create_dir_all(source.join(cam)).unwrap();
        }
        encode_clip(&source.join("cam1").join("A.mp4"), &[40, 200]);
        encode_clip(&source.join("cam2").join("A.mp4"), &[120, 120]);
        let layout = Layout::new(dir.path().join("out"));

        let report = run(&source, &layout, 2).await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            UnitFailure::ExtractionFailed { asset_id, reason }
                if asset_id == "A" && reason.contains("duplicate asset id")
        ));
        // Both stills come from the first clip in path order.
        let first = layout.original(Role::First).join("A_first_frame.jpg");
        let last = layout.original(Role::Last).join("A_last_frame.jpg");
        assert!((centre_grey(&first) - grey(40)).abs() <= 12);
        assert!((centre_grey(&last) - grey(200)).abs() <= 12);
    }
}
