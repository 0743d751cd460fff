use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use base64ct::{Base64, Encoding};
use bytes::Bytes;
use image::ImageFormat;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::rules::AVATAR_RE;
use crate::storage::StorageClient;

const THUMBNAIL_SIZE: u32 = 256;

/// Public URLs of a stored avatar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvatarView {
    pub original_image: String,
    pub thumbnail: String,
    pub filename: String,
}

impl AvatarView {
    pub fn compose(base_url: &str, user_id: Uuid, filename: &str) -> Self {
        let prefix = format!("{}/api/user/{}/avatar/", base_url.trim_end_matches('/'), user_id);
        Self {
            original_image: format!("{prefix}{}@{filename}", Variant::Original.as_str()),
            thumbnail: format!("{prefix}{}@{filename}", Variant::Thumbnail.as_str()),
            filename: filename.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Original,
    Thumbnail,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Original => "original",
            Variant::Thumbnail => "thumbnail",
        }
    }

    /// Split a `variant@filename` path segment.
    pub fn parse_segment(segment: &str) -> Option<(Variant, &str)> {
        let (variant, filename) = segment.split_once('@')?;
        let variant = match variant {
            "original" => Variant::Original,
            "thumbnail" => Variant::Thumbnail,
            _ => return None,
        };
        if filename.is_empty() || filename.contains('/') {
            return None;
        }
        Some((variant, filename))
    }
}

#[derive(Debug, Error)]
pub enum AvatarError {
    #[error("avatar is not a base64 image data uri")]
    Malformed,
    #[error("avatar is not a supported image")]
    Undecodable(#[from] image::ImageError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Decoded `data:image/<type>;base64,<payload>` input.
#[derive(Debug, Clone)]
pub struct DataUri {
    pub subtype: String,
    pub bytes: Bytes,
}

impl DataUri {
    pub fn parse(input: &str) -> Result<Self, AvatarError> {
        let caps = AVATAR_RE.captures(input).ok_or(AvatarError::Malformed)?;
        let bytes = Base64::decode_vec(&caps[2]).map_err(|_| AvatarError::Malformed)?;
        Ok(Self {
            subtype: caps[1].to_ascii_lowercase(),
            bytes: Bytes::from(bytes),
        })
    }
}

fn ext_from_subtype(subtype: &str) -> Option<&'static str> {
    match subtype {
        "jpeg" | "jpg" => Some("jpg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        _ => None,
    }
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit_once('.').map(|(_, ext)| ext) {
        Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn object_key(user_id: Uuid, variant: Variant, filename: &str) -> String {
    format!("avatars/{}/{}@{}", user_id, variant.as_str(), filename)
}

/// Scale `bytes` down to fit a `THUMBNAIL_SIZE` square, keeping `format`.
fn thumbnail(bytes: &[u8], format: ImageFormat) -> Result<Vec<u8>, AvatarError> {
    let img = image::load_from_memory_with_format(bytes, format)?;
    let thumb = img.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE);
    let mut out = Vec::new();
    thumb.write_to(&mut Cursor::new(&mut out), format)?;
    Ok(out)
}

/// Avatar files in object storage: an original and a thumbnail per upload.
#[derive(Clone)]
pub struct AvatarStore {
    storage: Arc<dyn StorageClient>,
}

impl AvatarStore {
    pub fn new(storage: Arc<dyn StorageClient>) -> Self {
        Self { storage }
    }

    /// Persist both sizes of a data-URI avatar; returns the new filename.
    pub async fn store(&self, user_id: Uuid, data_uri: &str) -> Result<String, AvatarError> {
        let uri = DataUri::parse(data_uri)?;
        let ext = ext_from_subtype(&uri.subtype).ok_or(AvatarError::Malformed)?;
        let format = ImageFormat::from_extension(ext).ok_or(AvatarError::Malformed)?;
        let thumb = thumbnail(&uri.bytes, format)?;

        let filename = format!("{}.{}", Uuid::new_v4(), ext);
        let content_type = content_type_for(&filename);
        for (variant, body) in [
            (Variant::Original, uri.bytes),
            (Variant::Thumbnail, Bytes::from(thumb)),
        ] {
            let key = object_key(user_id, variant, &filename);
            self.storage
                .put_object(&key, body, content_type)
                .await
                .with_context(|| format!("put_object {}", key))?;
        }
        tracing::debug!(%user_id, %filename, "avatar stored");
        Ok(filename)
    }

    /// Bytes and content type of one variant, if present.
    pub async fn fetch(
        &self,
        user_id: Uuid,
        variant: Variant,
        filename: &str,
    ) -> anyhow::Result<Option<(Bytes, &'static str)>> {
        let key = object_key(user_id, variant, filename);
        let body = self.storage.get_object(&key).await?;
        Ok(body.map(|b| (b, content_type_for(filename))))
    }

    pub async fn remove(&self, user_id: Uuid, filename: &str) -> anyhow::Result<()> {
        for variant in [Variant::Original, Variant::Thumbnail] {
            let key = object_key(user_id, variant, filename);
            self.storage
                .delete_object(&key)
                .await
                .with_context(|| format!("delete_object {}", key))?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use image::{ImageBuffer, Rgb};

    /// PNG data URI of a `side`×`side` image.
    pub(crate) fn png_data_uri(side: u32) -> String {
        let img = ImageBuffer::from_pixel(side, side, Rgb([200u8, 40, 40]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        format!("data:image/png;base64,{}", Base64::encode_string(&buf))
    }

    #[test]
    fn compose_trims_trailing_slash() {
        let id = Uuid::new_v4();
        let view = AvatarView::compose("http://x/", id, "abc.png");
        assert_eq!(
            view.original_image,
            format!("http://x/api/user/{id}/avatar/original@abc.png")
        );
        let view = AvatarView::compose("http://x", id, "abc.png");
        assert_eq!(
            view.thumbnail,
            format!("http://x/api/user/{id}/avatar/thumbnail@abc.png")
        );
    }

    #[test]
    fn parse_segment() {
        assert_eq!(
            Variant::parse_segment("original@abc.png"),
            Some((Variant::Original, "abc.png"))
        );
        assert_eq!(
            Variant::parse_segment("thumbnail@abc.png"),
            Some((Variant::Thumbnail, "abc.png"))
        );
        assert_eq!(Variant::parse_segment("large@abc.png"), None);
        assert_eq!(Variant::parse_segment("abc.png"), None);
        assert_eq!(Variant::parse_segment("original@"), None);
    }

    #[test]
    fn data_uri_parsing() {
        let uri = DataUri::parse("data:image/PNG;base64,aGVsbG8=").unwrap();
        assert_eq!(uri.subtype, "png");
        assert_eq!(&uri.bytes[..], b"hello");

        assert!(matches!(
            DataUri::parse("data:text/plain;base64,aGVsbG8="),
            Err(AvatarError::Malformed)
        ));
        assert!(matches!(
            DataUri::parse("data:image/png;base64,@@@"),
            Err(AvatarError::Malformed)
        ));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("a.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.webp"), "image/webp");
        assert_eq!(content_type_for("a"), "application/octet-stream");
        assert_eq!(ext_from_subtype("gif"), None);
    }

    #[tokio::test]
    async fn store_writes_original_and_thumbnail() {
        let storage = Arc::new(MemoryStorage::default());
        let avatars = AvatarStore::new(storage.clone());
        let user_id = Uuid::new_v4();

        let filename = avatars.store(user_id, &png_data_uri(600)).await.unwrap();
        assert!(filename.ends_with(".png"));

        let (original, ct) = avatars
            .fetch(user_id, Variant::Original, &filename)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ct, "image/png");
        let (thumb, _) = avatars
            .fetch(user_id, Variant::Thumbnail, &filename)
            .await
            .unwrap()
            .unwrap();

        let original = image::load_from_memory(&original).unwrap();
        let thumb = image::load_from_memory(&thumb).unwrap();
        assert_eq!(original.width(), 600);
        assert_eq!(thumb.width(), THUMBNAIL_SIZE);

        avatars.remove(user_id, &filename).await.unwrap();
        assert!(avatars
            .fetch(user_id, Variant::Original, &filename)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn store_rejects_garbage_payload() {
        let avatars = AvatarStore::new(Arc::new(MemoryStorage::default()));
        let err = avatars
            .store(Uuid::new_v4(), "data:image/png;base64,aGVsbG8=")
            .await
            .unwrap_err();
        assert!(matches!(err, AvatarError::Undecodable(_)));
    }
}
