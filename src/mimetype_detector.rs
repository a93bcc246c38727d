use std::fmt;
use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MimeType {
    type_: &'static str,
    subtype: &'static str,
}

impl MimeType {
    const fn new(type_: &'static str, subtype: &'static str) -> Self {
        Self { type_, subtype }
    }

    pub fn is_image(&self) -> bool {
        self.type_ == "image"
    }

    pub fn is_video(&self) -> bool {
        self.type_ == "video"
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.subtype)
    }
}

/// Detects the MIME type from the file extension.
pub fn from_path(path: &Path) -> Option<MimeType> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(from_extension)
}

pub fn from_extension(ext: &str) -> Option<MimeType> {
    let ext = ext.trim_start_matches('.').to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" | "jpe" => Some(MimeType::new("image", "jpeg")),
        "png" => Some(MimeType::new("image", "png")),
        "gif" => Some(MimeType::new("image", "gif")),
        "webp" => Some(MimeType::new("image", "webp")),
        "bmp" => Some(MimeType::new("image", "bmp")),
        "tiff" | "tif" => Some(MimeType::new("image", "tiff")),
        "heic" | "heif" => Some(MimeType::new("image", "heic")),
        "avif" => Some(MimeType::new("image", "avif")),

        "mp4" => Some(MimeType::new("video", "mp4")),
        "mov" => Some(MimeType::new("video", "quicktime")),
        "mkv" => Some(MimeType::new("video", "x-matroska")),
        "webm" => Some(MimeType::new("video", "webm")),

        _ => None,
    }
}

/// MIME string for catalog records, falling back to `application/octet-stream`.
pub fn mime_string(path: &Path) -> String {
    from_path(path)
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_image_types() {
        assert_eq!(mime_string(&PathBuf::from("photo.jpg")), "image/jpeg");
        assert_eq!(mime_string(&PathBuf::from("/a/b/PHOTO.JPEG")), "image/jpeg");
        assert_eq!(mime_string(&PathBuf::from("scan.TIF")), "image/tiff");
        assert!(from_path(&PathBuf::from("x.webp")).unwrap().is_image());
    }

    #[test]
    fn test_unknown_falls_back_to_octet_stream() {
        assert_eq!(mime_string(&PathBuf::from("notes.txt")), OCTET_STREAM);
        assert_eq!(mime_string(&PathBuf::from("no_extension")), OCTET_STREAM);
    }

    #[test]
    fn test_video_types() {
        let mime = from_extension(".MOV").unwrap();
        assert!(mime.is_video());
        assert_eq!(mime.to_string(), "video/quicktime");
    }
}
