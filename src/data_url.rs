//! Converting page images to `data:` URLs for vision models.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    let base64_data = BASE64_STANDARD.encode(data);
    // Some sources indicate that the Base64 data should be percent-encoded, but
    // in practice this breaks several vision models.
    format!("data:{};base64,{}", mime_type, base64_data)
}

/// Convert an image to a `data:` URL, sniffing the MIME type from the bytes
/// and falling back to `fallback_mime_type` (usually guessed from the file
/// extension).
pub fn image_data_url(data: &[u8], fallback_mime_type: &str) -> String {
    let mime_type = infer::get(data)
        .map(|kind| kind.mime_type())
        .filter(|mime_type| mime_type.starts_with("image/"))
        .unwrap_or(fallback_mime_type);
    data_url(mime_type, data)
}
