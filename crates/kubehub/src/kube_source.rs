//! kube-backed list/watch and writes over `DynamicObject`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use corral_core::{CorralError, CorralResult, ObjectRecord, ResourceVersion};
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, PostParams, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    Client, Config,
};
use tracing::{debug, warn};

use crate::source::{ListWatcher, Listing, RemoteWriter, WatchEvent, WatchStream, WriteRequest};
use crate::{strip_managed_fields, ResolvedResource};

/// Annotation carrying the lease fencing token of the last leader write.
pub const FENCING_ANNOTATION: &str = "corral.io/fencing-token";

/// Build a client from an explicit kubeconfig, else the default chain
/// (`KUBECONFIG`/`~/.kube/config`, then in-cluster).
pub async fn client_from(kubeconfig: Option<&Path>) -> CorralResult<Client> {
    let client = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .map_err(|e| CorralError::Configuration(format!("reading {}: {}", path.display(), e)))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(|e| CorralError::Configuration(e.to_string()))?;
            Client::try_from(cfg).map_err(|e| CorralError::Configuration(e.to_string()))?
        }
        None => Client::try_default().await.map_err(|e| CorralError::Configuration(e.to_string()))?,
    };
    Ok(client)
}

/// Map kube errors onto the corral taxonomy by HTTP status.
pub fn map_kube_error(err: kube::Error) -> CorralError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            410 => CorralError::ResourceExpired(resp.message),
            409 => CorralError::Conflict(resp.message),
            404 => CorralError::NotFound(resp.message),
            code => CorralError::Transport(format!("api error {}: {}", code, resp.message)),
        },
        other => CorralError::Transport(other.to_string()),
    }
}

fn api_for(client: &Client, res: &ResolvedResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match (res.namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &res.api_resource),
        _ => Api::all_with(client.clone(), &res.api_resource),
    }
}

fn to_record(kind: &str, obj: &DynamicObject) -> CorralResult<ObjectRecord> {
    let mut raw = serde_json::to_value(obj).map_err(|e| CorralError::InvalidObject(e.to_string()))?;
    strip_managed_fields(&mut raw);
    ObjectRecord::from_raw(kind, raw)
}

pub struct KubeListWatcher {
    api: Api<DynamicObject>,
    kind: String,
    timeout: Duration,
}

impl KubeListWatcher {
    /// `namespace = None` watches all namespaces.
    pub fn new(client: &Client, res: &ResolvedResource, namespace: Option<&str>, timeout: Duration) -> Self {
        Self { api: api_for(client, res, namespace), kind: res.api_resource.kind.clone(), timeout }
    }
}

#[async_trait]
impl ListWatcher for KubeListWatcher {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn list(&self) -> CorralResult<Listing> {
        let list = self.api.list(&ListParams::default()).await.map_err(map_kube_error)?;
        let resource_version = list
            .metadata
            .resource_version
            .as_deref()
            .ok_or_else(|| CorralError::InvalidObject("list without resourceVersion".into()))?
            .parse::<ResourceVersion>()?;
        let mut items = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            match to_record(&self.kind, obj) {
                Ok(rec) => items.push(rec),
                Err(e) => warn!(kind = %self.kind, error = %e, "skipping listed object"),
            }
        }
        Ok(Listing { items, resource_version })
    }

    async fn watch(&self, since: ResourceVersion) -> CorralResult<WatchStream> {
        // apiserver caps watch timeouts below 295s
        let secs = self.timeout.as_secs().clamp(1, 290) as u32;
        let wp = WatchParams::default().timeout(secs);
        let stream = self.api.watch(&wp, &since.to_string()).await.map_err(map_kube_error)?;
        let kind = self.kind.clone();
        debug!(kind = %kind, since = %since, "kube watch opened");
        let mapped = stream.map_err(map_kube_error).filter_map(move |item| {
            let out = match item {
                Ok(kube::api::WatchEvent::Added(o)) => Some(to_record(&kind, &o).map(WatchEvent::Added)),
                Ok(kube::api::WatchEvent::Modified(o)) => Some(to_record(&kind, &o).map(WatchEvent::Modified)),
                Ok(kube::api::WatchEvent::Deleted(o)) => Some(to_record(&kind, &o).map(WatchEvent::Deleted)),
                Ok(kube::api::WatchEvent::Bookmark(bm)) => {
                    Some(bm.metadata.resource_version.parse::<ResourceVersion>().map(WatchEvent::Bookmark))
                }
                Ok(kube::api::WatchEvent::Error(resp)) if resp.code == 410 => {
                    Some(Err(CorralError::ResourceExpired(resp.message)))
                }
                Ok(kube::api::WatchEvent::Error(resp)) => {
                    Some(Err(CorralError::Transport(format!("watch error {}: {}", resp.code, resp.message))))
                }
                Err(e) => Some(Err(e)),
            };
            // A malformed object is logged and skipped, not fatal to the watch.
            let out = match out {
                Some(Err(CorralError::InvalidObject(msg))) => {
                    warn!(kind = %kind, error = %msg, "skipping watched object");
                    None
                }
                other => other,
            };
            futures::future::ready(out)
        });
        Ok(mapped.boxed())
    }
}

/// Conditional writes with optimistic concurrency and fencing.
pub struct KubeWriter {
    client: Client,
    res: ResolvedResource,
}

impl KubeWriter {
    pub fn new(client: Client, res: ResolvedResource) -> Self {
        Self { client, res }
    }
}

fn fencing_token_of(obj: &DynamicObject) -> u64 {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(FENCING_ANNOTATION))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl RemoteWriter for KubeWriter {
    async fn write(&self, req: WriteRequest) -> CorralResult<ResourceVersion> {
        let api = api_for(&self.client, &self.res, req.key.namespace.as_deref());
        let mut obj: DynamicObject =
            serde_json::from_value(req.body).map_err(|e| CorralError::InvalidObject(e.to_string()))?;
        let live = api.get_opt(&req.key.name).await.map_err(map_kube_error)?;

        if let Some(token) = req.fencing_token {
            let current = live.as_ref().map(fencing_token_of).unwrap_or(0);
            if token < current {
                return Err(CorralError::Fenced { presented: token, current });
            }
            obj.metadata.annotations.get_or_insert_with(Default::default).insert(FENCING_ANNOTATION.into(), token.to_string());
        }

        let written = match (live, req.expected_version) {
            (Some(_), Some(exp)) => {
                // apiserver rejects with 409 if the live version moved
                obj.metadata.resource_version = Some(exp.to_string());
                api.replace(&req.key.name, &PostParams::default(), &obj).await
            }
            (Some(live), None) => {
                obj.metadata.resource_version = live.metadata.resource_version.clone();
                api.replace(&req.key.name, &PostParams::default(), &obj).await
            }
            (None, Some(_)) => return Err(CorralError::NotFound(req.key.to_string())),
            (None, None) => {
                obj.metadata.resource_version = None;
                api.create(&PostParams::default(), &obj).await
            }
        }
        .map_err(map_kube_error)?;

        written
            .metadata
            .resource_version
            .as_deref()
            .ok_or_else(|| CorralError::InvalidObject("write response without resourceVersion".into()))?
            .parse()
    }
}

/// `ApiResource` for a kube type known at compile time.
pub(crate) fn erased<K>() -> ApiResource
where
    K: kube::Resource<DynamicType = ()>,
{
    ApiResource::erase::<K>(&())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "m".into(), reason: "r".into(), code })
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(map_kube_error(api_err(410)), CorralError::ResourceExpired(_)));
        assert!(matches!(map_kube_error(api_err(409)), CorralError::Conflict(_)));
        assert!(matches!(map_kube_error(api_err(404)), CorralError::NotFound(_)));
        let other = map_kube_error(api_err(500));
        assert!(other.is_transient());
    }

    #[test]
    fn fencing_annotation_parses() {
        let mut obj = DynamicObject::new("x", &erased::<k8s_openapi::api::core::v1::Pod>());
        assert_eq!(fencing_token_of(&obj), 0);
        obj.metadata.annotations = Some([(FENCING_ANNOTATION.to_string(), "7".to_string())].into_iter().collect());
        assert_eq!(fencing_token_of(&obj), 7);
    }
}
