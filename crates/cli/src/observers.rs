//! Logging observer and reconciler used by the long-running subcommands.

use async_trait::async_trait;
use corral_controller::{Action, ReconcileContext, Reconciler};
use corral_core::columns::desired_replicas;
use corral_core::{ChangeEvent, CorralResult, ObjectKey, ObjectRecord};
use corral_store::EventHandler;
use tracing::info;

/// Logs `Deployment ADDED ns/name` style lines.
pub struct EventLogger;

#[async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &str {
        "event-logger"
    }

    async fn handle(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let key = event.key();
        info!(kind = %key.kind, verb = event.verb(), key = %key, "{}", event_line(event));
        Ok(())
    }
}

pub fn event_line(event: &ChangeEvent) -> String {
    let key = event.key();
    let verb = event.verb();
    match &key.namespace {
        Some(ns) => format!("{} {}: {}/{}", key.kind, verb, ns, key.name),
        None => format!("{} {}: {}", key.kind, verb, key.name),
    }
}

/// First container image of a pod template, or `unknown`.
pub fn first_image(raw: &serde_json::Value) -> &str {
    raw.pointer("/spec/template/spec/containers/0/image").and_then(|v| v.as_str()).unwrap_or("unknown")
}

/// Re-reads each deployment from the cache and logs what it sees.
pub struct DeploymentLogger {
    pub with_image: bool,
}

impl DeploymentLogger {
    fn log(&self, rec: &ObjectRecord) {
        let replicas = desired_replicas(&rec.raw);
        let ready = rec.raw.pointer("/status/readyReplicas").and_then(|v| v.as_u64()).unwrap_or(0);
        let ns = rec.key.namespace.as_deref().unwrap_or("");
        let terminating = rec.is_terminating();
        if self.with_image {
            info!(name = %rec.key.name, namespace = %ns, replicas, ready, terminating, image = %first_image(&rec.raw), "deployment event");
        } else {
            info!(name = %rec.key.name, namespace = %ns, replicas, ready, terminating, "deployment event");
        }
    }
}

#[async_trait]
impl Reconciler for DeploymentLogger {
    async fn reconcile(&self, ctx: &ReconcileContext, key: &ObjectKey) -> CorralResult<Action> {
        match ctx.store().get(key) {
            Some(rec) => self.log(&rec),
            None => info!(name = %key.name, namespace = %key.namespace.as_deref().unwrap_or(""), "deployment deleted"),
        }
        Ok(Action::Done)
    }
}
