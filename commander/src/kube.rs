use crate::{
    constants::{KUBE_API_PAGE_SIZE, KUBE_CALL_TIMEOUT},
    error::{
        kube_api_error, InvariantViolationSnafu, K8sClientGenerationSnafu, KubeconfigInferSnafu,
        KubeconfigLoadSnafu, Result,
    },
};
use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{oneshot, ApiCapabilities, Scope},
    Client, Config, ResourceExt,
};
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::sync::Mutex;

/// Summary of one CustomResourceDefinition, enough to query its instances.
#[derive(Debug, Clone)]
pub struct CrdSummary {
    pub name: String,
    pub served_version: Option<String>,
}

/// Read-only access to the cluster, shared across all analysis layers of one
/// invocation. Kind discovery results are cached so a drift scan over many
/// documents of the same kind resolves each kind once.
#[derive(Clone)]
pub struct ClientSet {
    client: Client,
    discovery_cache: Arc<Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>>,
}

impl ClientSet {
    /// Build a client from an explicit kubeconfig path and/or context override,
    /// falling back to the environment's standard kubeconfig discovery.
    pub async fn new(
        kubeconfig: Option<PathBuf>,
        context: Option<String>,
        namespace: Option<String>,
    ) -> Result<Self> {
        let options = KubeConfigOptions {
            context,
            ..Default::default()
        };
        let mut config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).context(KubeconfigLoadSnafu)?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .context(KubeconfigLoadSnafu)?
            }
            None if options.context.is_some() => Config::from_kubeconfig(&options)
                .await
                .context(KubeconfigLoadSnafu)?,
            None => Config::infer().await.context(KubeconfigInferSnafu)?,
        };
        config.connect_timeout = Some(KUBE_CALL_TIMEOUT);
        config.read_timeout = Some(KUBE_CALL_TIMEOUT);
        if let Some(namespace) = namespace {
            config.default_namespace = namespace;
        }

        let client = Client::try_from(config).context(K8sClientGenerationSnafu)?;
        Ok(Self {
            client,
            discovery_cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The wrapped [`kube::Client`].
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    /// The namespace the active context defaults to.
    pub fn default_namespace(&self) -> String {
        self.client.default_namespace().to_string()
    }

    /// List Secrets, namespace-scoped when a namespace is given, else cluster-wide.
    pub async fn list_secrets(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Secret>> {
        let api: Api<Secret> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let action = list_action("Secrets", namespace, label_selector);
        paginated_list(api, list_params(label_selector, field_selector), &action).await
    }

    /// List ConfigMaps, namespace-scoped when a namespace is given, else cluster-wide.
    pub async fn list_configmaps(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let action = list_action("ConfigMaps", namespace, label_selector);
        paginated_list(api, list_params(label_selector, field_selector), &action).await
    }

    /// GET one arbitrary typed resource as a plain JSON tree.
    ///
    /// The namespace is ignored for cluster-scoped kinds. Not-found and
    /// access-denied surface as their distinct error variants so batch callers
    /// can degrade per item.
    pub async fn get_resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<serde_json::Value> {
        let (resource, capabilities) = self.discover(api_version, kind).await?;
        let api = self.dynamic_api(&resource, &capabilities, namespace);
        let action = format!(
            "getting {kind} '{scope}{name}'",
            scope = namespace.map(|ns| format!("{ns}/")).unwrap_or_default()
        );
        let object = api
            .get(name)
            .await
            .map_err(|source| kube_api_error(&action, source))?;
        to_tree(object)
    }

    /// List instances of one arbitrary typed resource by label selector.
    pub async fn list_labeled(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let (resource, capabilities) = self.discover(api_version, kind).await?;
        let api = self.dynamic_api(&resource, &capabilities, namespace);
        let action = list_action(kind, namespace, Some(label_selector));
        let objects = paginated_list(api, list_params(Some(label_selector), None), &action).await?;
        objects.into_iter().map(to_tree).collect()
    }

    /// List instances of a custom resource as plain JSON trees.
    pub async fn list_custom_resources(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let resource = ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: if group.is_empty() {
                version.to_string()
            } else {
                format!("{group}/{version}")
            },
            kind: plural.to_string(),
            plural: plural.to_string(),
        };
        let api: Api<DynamicObject> = match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        let action = list_action(plural, namespace, None);
        let objects = paginated_list(api, ListParams::default(), &action).await?;
        objects.into_iter().map(to_tree).collect()
    }

    /// GET one CustomResourceDefinition by name, `None` when it is not installed.
    pub async fn get_crd(&self, name: &str) -> Result<Option<CrdSummary>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let action = format!("getting CustomResourceDefinition '{name}'");
        match api.get(name).await {
            Ok(crd) => Ok(Some(summarize_crd(crd))),
            Err(source) => match kube_api_error(&action, source) {
                error if error.is_not_found() => Ok(None),
                error => Err(error),
            },
        }
    }

    /// List the names of all CustomResourceDefinitions, metadata only.
    pub async fn list_crds(&self) -> Result<Vec<String>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let mut names: Vec<String> = Vec::with_capacity(KUBE_API_PAGE_SIZE as usize);
        let mut list_params = ListParams::default().limit(KUBE_API_PAGE_SIZE);
        loop {
            let crd_list = api
                .list_metadata(&list_params)
                .await
                .map_err(|source| kube_api_error("listing CustomResourceDefinitions", source))?;
            let maybe_token = crd_list.metadata.continue_.clone();
            names.extend(crd_list.into_iter().map(|crd| crd.name_any()));
            match maybe_token {
                Some(ref token) if !token.is_empty() => {
                    list_params = list_params.continue_token(token);
                }
                _ => break,
            }
        }
        Ok(names)
    }

    /// Resolve `(apiVersion, kind)` to a concrete API resource, caching the
    /// discovery round-trip for the rest of the invocation.
    async fn discover(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities)> {
        let cache_key = format!("{api_version}/{kind}");
        let mut cache = self.discovery_cache.lock().await;
        if let Some(entry) = cache.get(&cache_key) {
            return Ok(entry.clone());
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let entry = oneshot::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|source| kube_api_error(&format!("discovering kind {kind}"), source))?;
        cache.insert(cache_key, entry.clone());
        Ok(entry)
    }

    fn dynamic_api(
        &self,
        resource: &ApiResource,
        capabilities: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (&capabilities.scope, namespace) {
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), resource),
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(self.client.clone(), namespace, resource)
            }
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), resource),
        }
    }
}

fn summarize_crd(crd: CustomResourceDefinition) -> CrdSummary {
    let served_version = crd
        .spec
        .versions
        .iter()
        .find(|version| version.served)
        .or_else(|| crd.spec.versions.first())
        .map(|version| version.name.clone());
    CrdSummary {
        name: crd.name_any(),
        served_version,
    }
}

fn to_tree(object: DynamicObject) -> Result<serde_json::Value> {
    serde_json::to_value(&object).map_err(|_| {
        InvariantViolationSnafu {
            message: "dynamic object failed to re-serialize".to_string(),
        }
        .build()
    })
}

fn list_params(label_selector: Option<&str>, field_selector: Option<&str>) -> ListParams {
    let mut list_params = ListParams::default();
    if let Some(labels) = label_selector {
        list_params = list_params.labels(labels);
    }
    if let Some(fields) = field_selector {
        list_params = list_params.fields(fields);
    }
    list_params
}

fn list_action(what: &str, namespace: Option<&str>, label_selector: Option<&str>) -> String {
    format!(
        "listing {what}{labels} in {scope}",
        labels = label_selector
            .map(|labels| format!(" labelled '{labels}'"))
            .unwrap_or_default(),
        scope = namespace
            .map(|namespace| format!("namespace '{namespace}'"))
            .unwrap_or_else(|| "all namespaces".to_string()),
    )
}

/// List all pages of a resource collection.
async fn paginated_list<K>(
    resource_api: Api<K>,
    list_params: ListParams,
    action: &str,
) -> Result<Vec<K>>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let mut resources: Vec<K> = Vec::with_capacity(KUBE_API_PAGE_SIZE as usize);
    let mut list_params = list_params.limit(KUBE_API_PAGE_SIZE);

    loop {
        let resource_list = resource_api
            .list(&list_params)
            .await
            .map_err(|source| kube_api_error(action, source))?;

        let maybe_token = resource_list.metadata.continue_.clone();

        resources.extend(resource_list);

        match maybe_token {
            Some(ref token) if !token.is_empty() => {
                list_params = list_params.continue_token(token);
            }
            _ => break,
        }
    }

    Ok(resources)
}
