//! Corral kubehub: list/watch sources, remote writes and the reflector.

#![forbid(unsafe_code)]

mod kube_source;
pub mod memory;
pub mod reflector;
mod source;

use corral_core::{CorralError, CorralResult};
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::debug;

pub use kube_source::{client_from, map_kube_error, KubeListWatcher, KubeWriter, FENCING_ANNOTATION};
pub use memory::MemoryCollection;
pub use reflector::{Reflector, ReflectorConfig, ReflectorState};
pub use source::{ListWatcher, Listing, RemoteWriter, WatchEvent, WatchStream, WriteRequest};

/// An API resource plus its scope.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

/// Resources known without discovery. Accepts the plural CLI name, the
/// singular, or the gvk key.
pub fn builtin_resource(name: &str) -> Option<ResolvedResource> {
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod, core::v1::Service};
    let api_resource = match name.to_ascii_lowercase().as_str() {
        "deployments" | "deployment" | "deploy" | "apps/v1/deployment" => kube_source::erased::<Deployment>(),
        "pods" | "pod" | "po" | "v1/pod" => kube_source::erased::<Pod>(),
        "services" | "service" | "svc" | "v1/service" => kube_source::erased::<Service>(),
        _ => return None,
    };
    Some(ResolvedResource { api_resource, namespaced: true })
}

/// Built-in kinds first, otherwise a `v1/Kind` or `group/v1/Kind` key
/// resolved through API discovery.
pub async fn resolve_resource(client: &Client, key: &str) -> CorralResult<ResolvedResource> {
    if let Some(res) = builtin_resource(key) {
        return Ok(res);
    }
    let gvk = parse_gvk_key(key)?;
    find_api_resource(client.clone(), &gvk).await
}

fn parse_gvk_key(key: &str) -> CorralResult<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(CorralError::Configuration(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> CorralResult<ResolvedResource> {
    let discovery = Discovery::new(client).run().await.map_err(map_kube_error)?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(group = %ar.group, version = %ar.version, kind = %ar.kind, namespaced, "resolved via discovery");
                return Ok(ResolvedResource { api_resource: ar, namespaced });
            }
        }
    }
    Err(CorralError::Configuration(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_resolve() {
        let d = builtin_resource("deployments").unwrap();
        assert_eq!(d.api_resource.kind, "Deployment");
        assert_eq!(d.api_resource.group, "apps");
        assert_eq!(builtin_resource("svc").unwrap().api_resource.plural, "services");
        assert_eq!(builtin_resource("v1/Pod").unwrap().api_resource.kind, "Pod");
        assert!(builtin_resource("widgets").is_none());
    }

    #[test]
    fn gvk_keys_parse() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let grouped = parse_gvk_key("example.io/v1alpha1/Widget").unwrap();
        assert_eq!(grouped.group, "example.io");
        assert!(matches!(parse_gvk_key("Widget"), Err(CorralError::Configuration(_))));
    }

    #[test]
    fn managed_fields_are_dropped() {
        let mut v = serde_json::json!({ "metadata": { "name": "a", "managedFields": [{}] } });
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
    }
}
