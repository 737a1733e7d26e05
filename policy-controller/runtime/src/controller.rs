use crate::{
    k8s::{
        generated::{self, API_VERSION, TEMPLATE_LABEL},
        policy::NetworkPolicyTemplate,
        Api, Client, DynamicObject, GeneratedKind, Namespace,
    },
    reconcile::{Error, KubeStore, Reconciler},
};
use futures::prelude::*;
use kube::runtime::{
    controller::{Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use std::sync::Arc;
use tokio::{sync::oneshot, time::Duration};
use tracing::{debug, info, warn};

pub(crate) struct Context {
    pub(crate) reconciler: Reconciler<KubeStore>,
    pub(crate) error_requeue: Duration,
    pub(crate) resync: Duration,
}

/// Drives template reconciliation until the runtime begins shutting down.
///
/// A template is queued when it changes, when any namespace changes, and when
/// a policy it owns changes.
pub(crate) async fn run(client: Client, ctx: Arc<Context>, drain: drain::Watch) {
    let templates = Api::<NetworkPolicyTemplate>::all(client.clone());
    let mut controller = Controller::new(templates, watcher::Config::default());

    let cache = controller.store();
    controller = controller.watches(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default(),
        move |_: Namespace| {
            cache
                .state()
                .into_iter()
                .map(|t| ObjectRef::from_obj(&*t))
                .collect::<Vec<_>>()
        },
    );

    for kind in GeneratedKind::ALL {
        if !kind_exists(&client, kind).await {
            warn!(%kind, "Resource kind not found, skipping watches");
            continue;
        }
        let ar = kind.api_resource();
        controller = controller.watches_with(
            Api::<DynamicObject>::all_with(client.clone(), &ar),
            ar,
            watcher::Config::default().labels(TEMPLATE_LABEL),
            |policy: DynamicObject| {
                generated::template_owner(&policy.metadata).map(ObjectRef::new)
            },
        );
    }

    let (close_tx, close_rx) = oneshot::channel::<()>();
    let controller = controller
        .graceful_shutdown_on(close_rx.map(|_| ()))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((template, _)) => debug!(template = %template.name, "Reconciled"),
                Err(error) => warn!(%error, "Reconciliation failed"),
            }
        });
    tokio::pin!(controller);

    info!("Template controller running");
    tokio::select! {
        _ = (&mut controller) => {}
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(controller).await;
        }
    }
}

async fn reconcile(template: Arc<NetworkPolicyTemplate>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.reconciler.reconcile(&template).await?;
    Ok(Action::requeue(ctx.resync))
}

fn error_policy(template: Arc<NetworkPolicyTemplate>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(template = ?template.metadata.name, %error, "Requeueing template");
    Action::requeue(ctx.error_requeue)
}

async fn kind_exists(client: &Client, kind: GeneratedKind) -> bool {
    client
        .list_api_group_resources(API_VERSION)
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == kind.kind())
}
