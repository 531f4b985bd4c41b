//! Two-phase manifest apply: custom resource type definitions first (in
//! parallel, since they only need read access to a shared REST mapping),
//! then everything else sequentially (since later documents may depend on
//! types phase 1 just registered).

use crate::manifest::{self, ManifestDocument, ManifestError};
use futures::stream::{self, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, PostParams};
use kube::Client;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Phase 1 (custom resource definitions) runs with at most this many
/// concurrent creates.
pub const DEFAULT_PHASE1_PARALLELISM: usize = 10;

/// How many times to refresh-and-retry a REST mapping miss, to give a
/// type registered earlier in phase 1 (or earlier in phase 2) time to
/// propagate into discovery.
const MAX_MAPPING_RETRIES: u32 = 5;
const MAPPING_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Default namespace objects are applied into when they don't specify one.
const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Snafu)]
pub enum ApplyError {
    #[snafu(display("failed to decode manifests: {source}"))]
    Decode { source: ManifestError },

    #[snafu(display("document #{index} in {path:?} is missing a 'kind' field"))]
    MissingKind { path: PathBuf, index: usize },

    #[snafu(display(
        "could not resolve a REST mapping for {group}/{version} {kind} after {attempts} attempts"
    ))]
    NoMapping {
        group: String,
        version: String,
        kind: String,
        attempts: u32,
    },

    #[snafu(display("failed to query API discovery: {source}"))]
    Discovery { source: kube::Error },

    #[snafu(display(
        "failed to create {kind} '{name}' from {path:?} document #{index}: {source}"
    ))]
    Create {
        kind: String,
        name: String,
        path: PathBuf,
        index: usize,
        source: kube::Error,
    },
}

/// Caches GVK -> REST mapping, refreshed from live discovery on a miss.
///
/// There is no convenience discovery helper on the `kube` version this
/// workspace pins, so the mapper walks `/api` and `/apis/<group>/<version>`
/// directly and keeps the result in a plain map behind a mutex, mirroring
/// the once-built-then-cached REST mapping the launched API server itself
/// keeps for its own clients.
pub struct RestMapper {
    client: Client,
    cache: Mutex<HashMap<(String, String, String), MappedResource>>,
}

/// A resolved REST mapping plus the resource scope discovery reported for
/// it. `kube`'s own `ApiResource` has no `namespaced` field, so it's kept
/// alongside rather than discarded.
#[derive(Debug, Clone)]
struct MappedResource {
    api_resource: ApiResource,
    namespaced: bool,
}

impl RestMapper {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Option<MappedResource> {
        let key = (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone());
        self.cache.lock().await.get(&key).cloned()
    }

    /// Re-query discovery and repopulate the cache from scratch.
    async fn refresh(&self) -> Result<(), ApplyError> {
        let mut fresh = HashMap::new();

        let core_list: APIResourceList = self
            .client
            .request(
                http::Request::builder()
                    .uri("/api/v1")
                    .body(Vec::new())
                    .expect("static request is always valid"),
            )
            .await
            .context(DiscoverySnafu)?;
        insert_group_version(&mut fresh, "", "v1", &core_list);

        let groups: k8s_openapi::apimachinery::pkg::apis::meta::v1::APIGroupList = self
            .client
            .request(
                http::Request::builder()
                    .uri("/apis")
                    .body(Vec::new())
                    .expect("static request is always valid"),
            )
            .await
            .context(DiscoverySnafu)?;

        for group in groups.groups {
            let Some(preferred) = group.preferred_version.or_else(|| group.versions.first().cloned())
            else {
                continue;
            };
            let uri = format!("/apis/{}/{}", group.name, preferred.version);
            let resources: APIResourceList = match self
                .client
                .request(
                    http::Request::builder()
                        .uri(uri)
                        .body(Vec::new())
                        .expect("static request is always valid"),
                )
                .await
            {
                Ok(resources) => resources,
                Err(err) => {
                    debug!(group = %group.name, %err, "skipping group that failed discovery");
                    continue;
                }
            };
            insert_group_version(&mut fresh, &group.name, &preferred.version, &resources);
        }

        *self.cache.lock().await = fresh;
        Ok(())
    }

    async fn resolve_with_refresh(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<MappedResource, ApplyError> {
        if let Some(resource) = self.resolve(gvk).await {
            return Ok(resource);
        }

        for _ in 1..=MAX_MAPPING_RETRIES {
            if let Err(err) = self.refresh().await {
                warn!(%err, "discovery refresh failed while resolving a REST mapping");
            } else if let Some(resource) = self.resolve(gvk).await {
                return Ok(resource);
            }
            tokio::time::sleep(MAPPING_RETRY_DELAY).await;
        }

        NoMappingSnafu {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            attempts: MAX_MAPPING_RETRIES,
        }
        .fail()
    }
}

fn insert_group_version(
    map: &mut HashMap<(String, String, String), MappedResource>,
    group: &str,
    version: &str,
    list: &APIResourceList,
) {
    for resource in &list.resources {
        // Subresources (e.g. "pods/status") are not independently creatable.
        if resource.name.contains('/') {
            continue;
        }
        let api_resource = ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            kind: resource.kind.clone(),
            api_version: if group.is_empty() {
                version.to_string()
            } else {
                format!("{group}/{version}")
            },
            plural: resource.name.clone(),
        };
        map.insert(
            (group.to_string(), version.to_string(), resource.kind.clone()),
            MappedResource {
                api_resource,
                namespaced: resource.namespaced,
            },
        );
    }
}

/// Recognize a "missing kind" failure both through the typed check
/// ([`ApplyError::MissingKind`]) and, as a fallback, a stable substring
/// match — because some decode paths wrap the underlying error in a way
/// that does not preserve type identity.
pub fn is_missing_kind_error(err: &ApplyError) -> bool {
    match err {
        ApplyError::MissingKind { .. } => true,
        ApplyError::Decode { source } => format!("{source}").contains("missing field `kind`"),
        _ => false,
    }
}

fn document_gvk(doc: &ManifestDocument) -> Result<GroupVersionKind, ApplyError> {
    let types = doc.object.types.as_ref().ok_or_else(|| ApplyError::MissingKind {
        path: doc.source_path.clone(),
        index: doc.index,
    })?;
    Ok(parse_gvk(&types.api_version, &types.kind))
}

fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    }
}

async fn create_document(
    client: &Client,
    mapper: &RestMapper,
    doc: &ManifestDocument,
) -> Result<(), ApplyError> {
    let gvk = document_gvk(doc)?;
    let mapped = mapper.resolve_with_refresh(&gvk).await?;

    let name = doc
        .object
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| "<unnamed>".to_string());

    let mut object = doc.object.clone();
    let api: Api<DynamicObject> = if mapped.namespaced {
        if object.metadata.namespace.is_none() {
            object.metadata.namespace = Some(DEFAULT_NAMESPACE.to_string());
        }
        let namespace = object
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        Api::namespaced_with(client.clone(), &namespace, &mapped.api_resource)
    } else {
        Api::all_with(client.clone(), &mapped.api_resource)
    };

    api.create(&PostParams::default(), &object)
        .await
        .context(CreateSnafu {
            kind: mapped.api_resource.kind.clone(),
            name,
            path: doc.source_path.clone(),
            index: doc.index,
        })?;
    Ok(())
}

/// Parse and apply every manifest document under `files`: phase 1 (custom
/// resource definitions) bounded-parallel, phase 2 (everything else)
/// sequential.
pub async fn apply_manifests(
    client: &Client,
    files: &std::collections::BTreeMap<PathBuf, String>,
    phase1_parallelism: usize,
) -> Result<(), ApplyError> {
    let documents = manifest::parse_documents(files).context(DecodeSnafu)?;
    let (phase1, phase2) = manifest::partition(documents);
    let mapper = RestMapper::new(client.clone());

    debug!(
        phase1 = phase1.len(),
        phase2 = phase2.len(),
        "applying manifests"
    );

    let results: Vec<Result<(), ApplyError>> = stream::iter(phase1.iter())
        .map(|doc| create_document(client, &mapper, doc))
        .buffer_unordered(phase1_parallelism.max(1))
        .collect()
        .await;
    for result in results {
        result?;
    }

    for doc in &phase2 {
        create_document(client, &mapper, doc).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_group_as_empty_string() {
        let gvk = parse_gvk("v1", "Namespace");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn parses_grouped_api_version() {
        let gvk = parse_gvk("apiextensions.k8s.io/v1", "CustomResourceDefinition");
        assert_eq!(gvk.group, "apiextensions.k8s.io");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn missing_kind_is_recognized_through_typed_variant() {
        let err = ApplyError::MissingKind {
            path: PathBuf::from("a.yaml"),
            index: 0,
        };
        assert!(is_missing_kind_error(&err));
    }

    #[test]
    fn insert_group_version_preserves_discovery_namespaced_flag() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;

        let list = APIResourceList {
            group_version: "apiextensions.k8s.io/v1".to_string(),
            resources: vec![
                APIResource {
                    name: "customresourcedefinitions".to_string(),
                    kind: "CustomResourceDefinition".to_string(),
                    namespaced: false,
                    ..Default::default()
                },
                APIResource {
                    name: "widgets".to_string(),
                    kind: "Widget".to_string(),
                    namespaced: true,
                    ..Default::default()
                },
            ],
        };

        let mut map = HashMap::new();
        insert_group_version(&mut map, "apiextensions.k8s.io", "v1", &list);

        let crd = &map[&(
            "apiextensions.k8s.io".to_string(),
            "v1".to_string(),
            "CustomResourceDefinition".to_string(),
        )];
        assert!(!crd.namespaced);

        let widget = &map[&(
            "apiextensions.k8s.io".to_string(),
            "v1".to_string(),
            "Widget".to_string(),
        )];
        assert!(widget.namespaced);
    }
}
