use snafu::Snafu;
use std::path::PathBuf;

/// A wrapper type to remove repeated Result<T, Error> returns.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors for the helm-commander lib.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to load kubeconfig: {source}"))]
    KubeconfigLoad { source: kube::config::KubeconfigError },

    #[snafu(display("Failed to infer kubernetes configuration: {source}"))]
    KubeconfigInfer { source: kube::config::InferConfigError },

    #[snafu(display("Failed to generate kubernetes client: {source}"))]
    K8sClientGeneration { source: kube::Error },

    #[snafu(display("Kubernetes cluster is unreachable while {action}: {source}"))]
    ClusterUnreachable { action: String, source: kube::Error },

    #[snafu(display("Access denied while {action}: {source}"))]
    AccessDenied { action: String, source: kube::Error },

    #[snafu(display("{resource} not found"))]
    ResourceNotFound { resource: String },

    #[snafu(display("Kubernetes API call failed while {action}: {source}"))]
    KubeApiCall { action: String, source: kube::Error },

    #[snafu(display("Corrupt release payload in {object}: {reason}"))]
    CorruptPayload { object: String, reason: String },

    #[snafu(display("Release payload in {object} is missing required field '{field}'"))]
    UnsupportedSchema { object: String, field: String },

    #[snafu(display("{object} does not carry the Helm release markers"))]
    UnknownStorage { object: String },

    #[snafu(display("Failed to read '{path}': {source}", path = path.display()))]
    CacheFileRead { path: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to parse '{path}': {source}", path = path.display()))]
    CacheFileParse { path: PathBuf, source: serde_yaml::Error },

    #[snafu(display("Failed to parse manifest document from {release}: {source}"))]
    ManifestParse { release: String, source: serde_yaml::Error },

    #[snafu(display("Deadline of {seconds}s exceeded, results are partial"))]
    DeadlineExceeded { seconds: u64 },

    #[snafu(display("Invariant violated, please report this as a bug: {message}"))]
    InvariantViolation { message: String },
}

impl Error {
    /// The invocation deadline expired; whatever was produced so far is partial.
    pub fn deadline(seconds: u64) -> Self {
        Error::DeadlineExceeded { seconds }
    }

    /// Stable machine-readable tag for this error, used in JSON/YAML error arrays.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeconfigLoad { .. }
            | Error::KubeconfigInfer { .. }
            | Error::K8sClientGeneration { .. }
            | Error::ClusterUnreachable { .. } => "cluster-unreachable",
            Error::AccessDenied { .. } => "access-denied",
            Error::ResourceNotFound { .. } => "not-found",
            Error::KubeApiCall { .. } => "api-error",
            Error::CorruptPayload { .. } => "corrupt-payload",
            Error::UnsupportedSchema { .. } => "unsupported-schema",
            Error::UnknownStorage { .. } => "unknown-storage",
            Error::CacheFileRead { .. } => "io-error",
            Error::CacheFileParse { .. } | Error::ManifestParse { .. } => "parse-error",
            Error::DeadlineExceeded { .. } => "timeout",
            Error::InvariantViolation { .. } => "invariant-violation",
        }
    }

    /// True when the error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// True when the error is a kubernetes authorization failure.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Error::AccessDenied { .. })
    }

    /// True when the whole invocation should abort instead of degrading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::KubeconfigLoad { .. }
                | Error::KubeconfigInfer { .. }
                | Error::K8sClientGeneration { .. }
                | Error::ClusterUnreachable { .. }
                | Error::InvariantViolation { .. }
        )
    }
}

/// Map a raw kube API failure onto the error taxonomy, keeping not-found and
/// access-denied distinguishable for callers which degrade per item.
pub(crate) fn kube_api_error(action: &str, source: kube::Error) -> Error {
    let action = action.to_string();
    match source {
        kube::Error::Api(response) if response.code == 404 => {
            Error::ResourceNotFound { resource: action }
        }
        kube::Error::Api(response) if response.code == 401 || response.code == 403 => {
            Error::AccessDenied {
                action,
                source: kube::Error::Api(response),
            }
        }
        kube::Error::Discovery(_) => Error::ResourceNotFound { resource: action },
        source @ (kube::Error::Service(_) | kube::Error::HyperError(_)) => {
            Error::ClusterUnreachable { action, source }
        }
        source => Error::KubeApiCall { action, source },
    }
}
