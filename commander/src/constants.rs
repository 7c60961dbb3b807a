use std::time::Duration;

/// The label key Helm sets on every release storage object.
pub const HELM_OWNER_LABEL_KEY: &str = "owner";
/// The label value Helm sets on every release storage object.
pub const HELM_OWNER_LABEL_VALUE: &str = "helm";
/// Label selector matching all Helm release storage objects.
pub const HELM_OWNER_SELECTOR: &str = "owner=helm";
/// The kubernetes Secret type used by the Helm secret storage driver.
pub const HELM_SECRET_TYPE: &str = "helm.sh/release.v1";
/// Field selector picking Helm release Secrets by type.
pub const HELM_SECRET_TYPE_SELECTOR: &str = "type=helm.sh/release.v1";
/// The data key under which Helm stores the encoded release payload.
pub const RELEASE_DATA_KEY: &str = "release";

/// Label carrying the release name on a storage object.
pub const RELEASE_NAME_LABEL: &str = "name";
/// Label carrying the release status on a storage object.
pub const RELEASE_STATUS_LABEL: &str = "status";
/// Label carrying the revision number on a storage object.
pub const RELEASE_VERSION_LABEL: &str = "version";

/// The label GitOps-rendered resources carry to name their release instance.
pub const INSTANCE_LABEL_KEY: &str = "app.kubernetes.io/instance";

/// The size of the data payload for paginated network API responses.
pub const KUBE_API_PAGE_SIZE: u32 = 500;
/// Default timeout for a single Kubernetes API call.
pub const KUBE_CALL_TIMEOUT: Duration = Duration::from_secs(15);
/// Default deadline for a whole invocation.
pub const INVOCATION_DEADLINE: Duration = Duration::from_secs(60);
/// Concurrent live-resource fetches during a drift scan.
pub const DRIFT_FETCH_CONCURRENCY: usize = 8;

/// Override for the Helm cache directory.
pub const HELM_CACHE_HOME_ENV: &str = "HELM_CACHE_HOME";
/// Override for the Helm configuration directory.
pub const HELM_CONFIG_HOME_ENV: &str = "HELM_CONFIG_HOME";
