//! Image retrieval and normalization to JPEG.

use std::io::Cursor;

use image::{DynamicImage, ImageError, ImageFormat};
use tracing::debug;
use url::Url;

use crate::error::{Result, SyncError};
use crate::fetch::Fetcher;

/// Decorative banners the site injects into chapter bodies.
const BANNER_MARKER: &str = "chapter-banners";

pub fn is_banner(src: &str) -> bool {
    src.contains(BANNER_MARKER)
}

/// Imgur serves bare ids without an extension; asking for `.jpg` returns the image.
pub fn normalize_image_url(url: &Url) -> Url {
    let is_imgur = url
        .host_str()
        .is_some_and(|host| host == "imgur.com" || host.ends_with(".imgur.com"));
    if !is_imgur {
        return url.clone();
    }
    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    if last_segment.is_empty() || last_segment.contains('.') {
        return url.clone();
    }
    let mut out = url.clone();
    out.set_path(&format!("{}.jpg", url.path()));
    out
}

/// Decodes any supported format, drops alpha and re-encodes as baseline JPEG.
pub fn recode_jpeg(url: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let media_err = |source: ImageError| SyncError::Media {
        url: url.to_string(),
        source,
    };

    let decoded = image::load_from_memory(bytes).map_err(media_err)?;
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());

    let mut out = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .map_err(media_err)?;
    debug!(url, input_bytes = bytes.len(), output_bytes = out.len(), "image recoded");
    Ok(out)
}

/// Fetches an image and returns it as JPEG bytes. Decoding runs on the blocking pool.
pub async fn fetch_jpeg(fetcher: &Fetcher, url: &Url) -> Result<Vec<u8>> {
    let url = normalize_image_url(url);
    let bytes = fetcher.fetch_bytes(&url).await?;

    let label = url.to_string();
    tokio::task::spawn_blocking(move || recode_jpeg(&label, &bytes))
        .await
        .map_err(|err| SyncError::Media {
            url: url.to_string(),
            source: ImageError::IoError(std::io::Error::other(format!(
                "image worker aborted: {err}"
            ))),
        })?
}
