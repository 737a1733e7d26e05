use crate::{
    admission::Admission,
    controller::{self, Context},
    reconcile::{ControllerMetrics, KubeStore, Reconciler},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "policy",
    about = "Materializes network policy templates and validates network policies"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "netplate=info,warn",
        env = "NETPLATE_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The username permitted to delete policies generated from templates.
    #[clap(
        long,
        default_value = "system:serviceaccount:netplate-system:netplate-controller"
    )]
    controller_identity: String,

    #[clap(long, default_value = "5000")]
    store_timeout_ms: u64,

    #[clap(long, default_value = "10")]
    error_requeue_secs: u64,

    /// How often each template is reconciled in the absence of changes.
    #[clap(long, default_value = "300")]
    resync_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            controller_identity,
            store_timeout_ms,
            error_requeue_secs,
            resync_secs,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("template_controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let client = runtime.client();
        let store = KubeStore::new(client.clone(), Duration::from_millis(store_timeout_ms));
        let ctx = Arc::new(Context {
            reconciler: Reconciler::new(store, controller_metrics),
            error_requeue: Duration::from_secs(error_requeue_secs),
            resync: Duration::from_secs(resync_secs),
        });
        tokio::spawn(
            controller::run(client.clone(), ctx, runtime.shutdown_handle())
                .instrument(info_span!("templates")),
        );

        let controller_identity: Arc<str> = controller_identity.into();
        let runtime =
            runtime.spawn_server(move || Admission::new(client.clone(), controller_identity.clone()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
