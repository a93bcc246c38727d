use exif::{In, Reader, Tag};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use log::{debug, warn};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::process::Command;

/// File name of the single derivative stored per catalog entry.
pub const PREVIEW_FILE_NAME: &str = "preview.jpg";

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("Source file not found: {0}")]
    SourceMissing(PathBuf),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("External renderer failed: {0}")]
    External(String),
}

pub type PreviewResult<T> = Result<T, PreviewError>;

/// Turns a source file into an encoded JPEG no larger than `max_dimension`
/// on either side. Blocking; callers run it off the async runtime.
pub trait PreviewRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    fn render(&self, source: &Path, max_dimension: u32, quality: u8) -> PreviewResult<Vec<u8>>;
}

/// In-process decoder and encoder built on the `image` crate.
pub struct ImageRenderer;

impl ImageRenderer {
    fn apply_orientation(img: DynamicImage, orientation: Option<u32>) -> DynamicImage {
        match orientation {
            Some(2) => img.fliph(),
            Some(3) => img.rotate180(),
            Some(4) => img.flipv(),
            Some(5) => img.fliph().rotate270(),
            Some(6) => img.rotate90(),
            Some(7) => img.fliph().rotate90(),
            Some(8) => img.rotate270(),
            _ => img,
        }
    }

    fn exif_orientation(source: &Path) -> Option<u32> {
        let file = File::open(source).ok()?;
        let exif = Reader::new()
            .read_from_container(&mut BufReader::new(file))
            .ok()?;
        exif.get_field(Tag::Orientation, In::PRIMARY)?
            .value
            .get_uint(0)
    }
}

impl PreviewRenderer for ImageRenderer {
    fn name(&self) -> &'static str {
        "image"
    }

    fn render(&self, source: &Path, max_dimension: u32, quality: u8) -> PreviewResult<Vec<u8>> {
        if !source.exists() {
            return Err(PreviewError::SourceMissing(source.to_path_buf()));
        }

        let img = image::open(source)?;
        let img = Self::apply_orientation(img, Self::exif_orientation(source));

        // Never upscale
        let img = if img.width() > max_dimension || img.height() > max_dimension {
            img.thumbnail(max_dimension, max_dimension)
        } else {
            img
        };

        encode_jpeg(img, quality)
    }
}

pub fn encode_jpeg(img: DynamicImage, quality: u8) -> PreviewResult<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)?;
    Ok(buffer.into_inner())
}

/// Renders through the ffmpeg CLI, which covers codecs the `image` crate lacks.
pub struct FfmpegRenderer {
    program: String,
}

impl FfmpegRenderer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Maps a 1..=100 quality onto ffmpeg's 2..=31 mjpeg qscale (lower is better).
    fn qscale(quality: u8) -> u32 {
        let quality = u32::from(quality.clamp(1, 100));
        2 + (100 - quality) * 29 / 99
    }
}

impl PreviewRenderer for FfmpegRenderer {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn render(&self, source: &Path, max_dimension: u32, quality: u8) -> PreviewResult<Vec<u8>> {
        if !source.exists() {
            return Err(PreviewError::SourceMissing(source.to_path_buf()));
        }

        let scale = format!(
            "scale='min({m},iw)':'min({m},ih)':force_original_aspect_ratio=decrease",
            m = max_dimension
        );
        let output = Command::new(&self.program)
            .args(["-v", "error", "-y", "-i"])
            .arg(source)
            .args(["-vf", &scale, "-frames:v", "1", "-q:v"])
            .arg(Self::qscale(quality).to_string())
            .args(["-f", "image2", "-c:v", "mjpeg", "pipe:1"])
            .output()
            .map_err(|e| PreviewError::External(format!("{} failed to start: {}", self.program, e)))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(PreviewError::External(format!(
                "{} exited with status {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

/// Tries `primary`, and `fallback` on any primary failure.
pub struct FallbackRenderer {
    primary: Box<dyn PreviewRenderer>,
    fallback: Box<dyn PreviewRenderer>,
}

impl FallbackRenderer {
    pub fn new(primary: Box<dyn PreviewRenderer>, fallback: Box<dyn PreviewRenderer>) -> Self {
        Self { primary, fallback }
    }
}

impl PreviewRenderer for FallbackRenderer {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn render(&self, source: &Path, max_dimension: u32, quality: u8) -> PreviewResult<Vec<u8>> {
        match self.primary.render(source, max_dimension, quality) {
            Ok(bytes) => Ok(bytes),
            Err(PreviewError::SourceMissing(path)) => Err(PreviewError::SourceMissing(path)),
            Err(e) => {
                warn!(
                    "{} renderer failed for {}, trying {}: {}",
                    self.primary.name(),
                    source.display(),
                    self.fallback.name(),
                    e
                );
                self.fallback.render(source, max_dimension, quality)
            }
        }
    }
}

/// `<previews_root>/<file_id>/preview.jpg`
pub fn preview_path(previews_root: &Path, file_id: i64) -> PathBuf {
    previews_root
        .join(file_id.to_string())
        .join(PREVIEW_FILE_NAME)
}

pub async fn write_preview(
    previews_root: &Path,
    file_id: i64,
    data: &[u8],
) -> std::io::Result<PathBuf> {
    let target = preview_path(previews_root, file_id);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, data).await?;
    debug!("Wrote preview {:?}", target);
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FailingRenderer {
        calls: Arc<AtomicUsize>,
    }

    impl PreviewRenderer for FailingRenderer {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn render(&self, _source: &Path, _max: u32, _quality: u8) -> PreviewResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PreviewError::External("boom".to_string()))
        }
    }

    fn create_test_image(dir: &TempDir, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.path().join(name);
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_image_renderer_bounds_dimensions() {
        let temp_dir = TempDir::new().unwrap();
        let source = create_test_image(&temp_dir, "wide.png", 1600, 400);

        let bytes = ImageRenderer.render(&source, 800, 80).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();

        assert_eq!(decoded.width(), 800);
        assert_eq!(decoded.height(), 200);
        assert_eq!(
            image::guess_format(&bytes).unwrap(),
            image::ImageFormat::Jpeg
        );
    }

    #[test]
    fn test_image_renderer_does_not_upscale() {
        let temp_dir = TempDir::new().unwrap();
        let source = create_test_image(&temp_dir, "small.png", 120, 90);

        let bytes = ImageRenderer.render(&source, 800, 80).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (120, 90));
    }

    #[test]
    fn test_fallback_used_when_primary_fails() {
        let temp_dir = TempDir::new().unwrap();
        let source = create_test_image(&temp_dir, "photo.png", 300, 300);
        let calls = Arc::new(AtomicUsize::new(0));

        let renderer = FallbackRenderer::new(
            Box::new(FailingRenderer {
                calls: calls.clone(),
            }),
            Box::new(ImageRenderer),
        );
        let bytes = renderer.render(&source, 100, 80).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 100));
    }

    #[test]
    fn test_missing_source_skips_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let renderer = FallbackRenderer::new(
            Box::new(ImageRenderer),
            Box::new(FailingRenderer {
                calls: calls.clone(),
            }),
        );

        let result = renderer.render(Path::new("/no/such/file.jpg"), 100, 80);
        assert!(matches!(result, Err(PreviewError::SourceMissing(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_qscale_range() {
        assert_eq!(FfmpegRenderer::qscale(100), 2);
        assert_eq!(FfmpegRenderer::qscale(1), 31);
        assert!(FfmpegRenderer::qscale(80) < 10);
    }

    #[tokio::test]
    async fn test_write_preview_layout() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_preview(temp_dir.path(), 42, b"jpeg").await.unwrap();
        assert_eq!(path, temp_dir.path().join("42").join("preview.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg");
    }
}
