//! `BrokerSecurity` controller
//!
//! Keeps the security registry in step with the `BrokerSecurity` resources
//! and re-reconciles brokers whenever a handler changes. A finalizer makes
//! sure a deleted resource also leaves the registry.

use crate::controller::{backoff_delay, Context};
use crate::crds::BrokerSecurity;
use crate::error::{Error, Result};
use crate::registry::{ObjectKey, SecurityHandler, SecurityRegistry};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const FINALIZER_NAME: &str = "broker.kestrel.io/security-finalizer";

/// Apply one finalizer event to the registry; true when it changed
pub async fn handle_event(registry: &SecurityRegistry, event: FinalizerEvent<BrokerSecurity>) -> bool {
    match event {
        FinalizerEvent::Apply(security) => registry.upsert(SecurityHandler::from_resource(&security)).await,
        FinalizerEvent::Cleanup(security) => {
            let key = ObjectKey::new(&security.namespace().unwrap_or_default(), &security.name_any());
            registry.remove(&key).await
        }
    }
}

#[instrument(skip(security, ctx), fields(security = %security.name_any(), namespace = ?security.namespace()))]
pub async fn reconcile(security: Arc<BrokerSecurity>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = security.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<BrokerSecurity> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, security, move |event| async move {
        if handle_event(&ctx.registry, event).await {
            info!("security handlers changed, reconciling brokers");
            ctx.trigger_brokers();
        }
        Ok::<_, Error>(Action::await_change())
    })
    .await
    .map_err(Error::from)
}

pub fn error_policy(security: Arc<BrokerSecurity>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!("security/{}/{}", security.namespace().unwrap_or_default(), security.name_any());
    let delay = backoff_delay(1).max(ctx.backoff.next(&key));
    warn!(security = %security.name_any(), error = %error, delay_secs = delay.as_secs(), "security reconcile failed");
    Action::requeue(delay)
}
