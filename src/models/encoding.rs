//! URL <-> container filename mapping and payload text encoding.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};

const FILENAME_PREFIX: &str = "media_";

/// Stable, reversible container filename for an object URL.
pub fn encode_media_filename(url: &str) -> String {
    format!("{}{}", FILENAME_PREFIX, URL_SAFE_NO_PAD.encode(url))
}

/// Inverse of [`encode_media_filename`]. `None` for foreign filenames.
pub fn decode_media_filename(filename: &str) -> Option<String> {
    let encoded = filename.strip_prefix(FILENAME_PREFIX)?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Containers only hold text; media bytes are stored as base64.
pub fn encode_content(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_content(text: &str) -> Option<Vec<u8>> {
    STANDARD.decode(text.trim()).ok()
}

/// MD5 hex digest used as the index checksum.
pub fn content_checksum(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_container_safe() {
        let name = encode_media_filename("https://cdn.example.com/a/b c.png?x=1");
        assert!(name.starts_with("media_"));
        assert!(!name.contains('/'));
        assert_eq!(
            decode_media_filename(&name).as_deref(),
            Some("https://cdn.example.com/a/b c.png?x=1")
        );
    }

    #[test]
    fn foreign_filenames_do_not_decode() {
        assert!(decode_media_filename("shard-manifest.json").is_none());
        assert!(decode_media_filename("media_***").is_none());
    }

    #[test]
    fn checksum_is_md5_hex() {
        assert_eq!(content_checksum(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
