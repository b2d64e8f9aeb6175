//! Raw binary images.

use std::path::Path;

use super::{AdapterContext, ContainerError, ContainerKind, ImageMetadata, RawImage};

pub fn read(path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
    let data = super::read_limited(path)?;
    let image = RawImage::from_payload(ContainerKind::Raw, data, ImageMetadata::default())?;
    let schema = super::schema_for(ctx, &image)?;
    super::check_image_size(schema, image.len())?;
    tracing::debug!(board = %image.board(), version = %image.version(), bytes = image.len(), "Raw image loaded");
    Ok(image)
}

pub fn write(image: &RawImage, path: &Path, _ctx: &AdapterContext<'_>) -> Result<(), ContainerError> {
    std::fs::write(path, image.payload()).map_err(|e| ContainerError::io(path, e))
}
