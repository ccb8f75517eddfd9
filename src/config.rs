use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

const DEFAULT_REPO_ID: &str = "vikhyatk/moondream2";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub source: ModelSource,
    pub reload: bool,
    pub max_upload_bytes: usize,
    pub max_concurrent_invocations: usize,
    pub shutdown_grace: Duration,
}

/// Where the backend is loaded from: a hub repository id or a local directory.
#[derive(Clone, Default)]
pub struct ModelSource {
    pub repo_id: String,
    pub revision: Option<String>,
    pub token: Option<String>,
    pub cache_dir: Option<PathBuf>,
}

impl ModelSource {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            ..Self::default()
        }
    }

    pub fn revision_label(&self) -> &str {
        self.revision.as_deref().unwrap_or("latest")
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSource")
            .field("repo_id", &self.repo_id)
            .field("revision", &self.revision)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::from_lookup(|key| env::var(key).ok()))
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut listen_addr = lookup("SERVER_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT));
        if let Some(port) = lookup("PORT").and_then(|v| v.parse::<u16>().ok()) {
            listen_addr.set_port(port);
        }

        let source = ModelSource {
            repo_id: lookup("MODEL_REPO_ID")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REPO_ID.to_string()),
            revision: lookup("MODEL_REVISION").filter(|v| !v.trim().is_empty()),
            token: lookup("HF_TOKEN").filter(|v| !v.trim().is_empty()),
            cache_dir: lookup("MODEL_CACHE_DIR").map(PathBuf::from),
        };

        let reload = lookup("RELOAD")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let max_upload_bytes = lookup("MAX_UPLOAD_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let max_concurrent_invocations = lookup("MAX_CONCURRENT_INVOCATIONS")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(1);
        let shutdown_grace = lookup("SHUTDOWN_GRACE_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(30));

        Self {
            listen_addr,
            source,
            reload,
            max_upload_bytes,
            max_concurrent_invocations,
            shutdown_grace,
        }
    }
}
