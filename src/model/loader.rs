use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use hf_hub::{Repo, RepoType, api::sync::{Api, ApiBuilder}};

use crate::{
    config::ModelSource,
    device::{DeviceKind, DeviceProfile, Precision},
};

const DEFAULT_REVISION: &str = "main";

/// Load-time options derived from the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub device: DeviceKind,
    pub precision: Precision,
    /// Accelerator every weight is pinned to. Always `None` on CPU: an empty
    /// placement would let some backends spread weights on their own.
    pub placement: Option<DeviceKind>,
}

impl LoadOptions {
    pub fn from_profile(profile: &DeviceProfile) -> Self {
        let placement = match profile.kind {
            DeviceKind::Cpu => None,
            accelerator => Some(accelerator),
        };
        Self {
            device: profile.kind,
            precision: profile.precision,
            placement,
        }
    }
}

/// Locate `filename` for the given source, downloading it from the model hub
/// unless the source names a local directory.
pub fn resolve_artifact(source: &ModelSource, filename: &str) -> Result<PathBuf> {
    let local = Path::new(&source.repo_id);
    if local.is_dir() {
        let path = local.join(filename);
        if !path.is_file() {
            bail!("model artifact missing: {}", path.display());
        }
        return Ok(path);
    }

    let api = hub_client(source)?;

    let revision = source
        .revision
        .clone()
        .unwrap_or_else(|| DEFAULT_REVISION.to_string());
    let repo = api.repo(Repo::with_revision(
        source.repo_id.clone(),
        RepoType::Model,
        revision.clone(),
    ));

    repo.get(filename)
        .with_context(|| format!("failed to fetch {filename} from {}@{revision}", source.repo_id))
}

fn hub_client(source: &ModelSource) -> Result<Api> {
    let mut builder = ApiBuilder::new().with_progress(false);
    // Keep the token ApiBuilder read from the local hub cache unless one was
    // configured.
    if let Some(token) = source.token.as_ref() {
        builder = builder.with_token(Some(token.clone()));
    }
    if let Some(dir) = source.cache_dir.as_ref() {
        builder = builder.with_cache_dir(dir.clone());
    }
    builder.build().context("failed to initialise model hub client")
}
