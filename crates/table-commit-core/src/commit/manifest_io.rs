//! Reading and writing manifest documents through [`FileIo`].
use bytes::Bytes;
use futures::future::try_join_all;
use snafu::prelude::*;

use crate::commit::{CommitError, ManifestCodecSnafu, StorageSnafu};
use crate::io::FileIo;
use crate::model::Manifest;

/// Directory, relative to the table root, holding manifests.
pub const MANIFEST_DIR: &str = "metadata";

/// A fresh, unique manifest location.
pub fn new_manifest_location() -> String {
    format!("{MANIFEST_DIR}/manifest-{}.json", uuid::Uuid::new_v4())
}

/// Read and decode one manifest.
pub async fn read_manifest(io: &dyn FileIo, location: &str) -> Result<Manifest, CommitError> {
    let bytes = io.read(location).await.context(StorageSnafu)?;
    serde_json::from_slice(&bytes).context(ManifestCodecSnafu { location })
}

/// Read manifests concurrently, preserving the input order.
pub async fn read_manifests(
    io: &dyn FileIo,
    locations: &[String],
) -> Result<Vec<(String, Manifest)>, CommitError> {
    try_join_all(locations.iter().map(|location| async move {
        let manifest = read_manifest(io, location).await?;
        Ok::<_, CommitError>((location.clone(), manifest))
    }))
    .await
}

/// Encode and write `manifest` to a new location, recording the location in
/// `written` once the write has been issued.
pub async fn write_manifest(
    io: &dyn FileIo,
    manifest: &Manifest,
    written: &mut Vec<String>,
) -> Result<String, CommitError> {
    let location = new_manifest_location();
    let json = serde_json::to_vec(manifest).context(ManifestCodecSnafu {
        location: location.as_str(),
    })?;
    // A failed write may still leave a partial file behind.
    written.push(location.clone());
    io.write(&location, Bytes::from(json))
        .await
        .context(StorageSnafu)?;
    Ok(location)
}
