use std::{convert::TryFrom, env, sync::Arc};

use models::{
    cluster::K8SClusterClient,
    constants::{CONTROLLER_INTERNAL_PORT, SAFE_UPDATER},
    telemetry,
};
use safe_updater::{
    check,
    leader::LeaderElector,
    metrics::SafeUpdaterMetrics,
    telemetry::{healthz, readyz, vending_metrics, HealthState},
    Reconciler, RolloutTarget, SafeUpdaterController,
};

use actix_web::{web::Data, App, HttpServer};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use snafu::ResultExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

const POD_NAME_ENV_VAR: &str = "POD_NAME";
const POD_NAMESPACE_ENV_VAR: &str = "POD_NAMESPACE";
const KUBERNETES_SERVICE_HOST_ENV_VAR: &str = "KUBERNETES_SERVICE_HOST";

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry_from_env().context(controller_error::TelemetryInitSnafu)?;

    let incluster_config =
        kube::Config::incluster_dns().context(controller_error::ConfigCreateSnafu)?;

    // The lease lives in our own namespace. Prefer the downward API, fall back to the service account's.
    let namespace = env::var(POD_NAMESPACE_ENV_VAR)
        .unwrap_or_else(|_| incluster_config.default_namespace.to_string());
    let identity = env::var(POD_NAME_ENV_VAR).context(controller_error::GetPodNameSnafu)?;

    let k8s_client = kube::client::Client::try_from(incluster_config)
        .context(controller_error::ClientCreateSnafu)?;

    // The meter provider has to be installed before any instruments are created.
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context(controller_error::PrometheusExporterSnafu)?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    let metrics = SafeUpdaterMetrics::from_global();

    let health = Arc::new(HealthState::new());

    let k8s_service_addr = env::var(KUBERNETES_SERVICE_HOST_ENV_VAR)
        .context(controller_error::MissingClusterIPFamilySnafu)?;
    let bindaddress = if k8s_service_addr.contains(':') {
        // IPv6 format
        "[::]"
    } else {
        // IPv4 format
        "0.0.0.0"
    };

    // Setup Http server to vend prometheus metrics and health probes
    let server_health = Data::from(Arc::clone(&health));
    let server_registry = Data::new(registry);
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(server_registry.clone())
            .app_data(server_health.clone())
            .service(vending_metrics)
            .service(healthz)
            .service(readyz)
    })
    .disable_signals()
    .bind(format!("{}:{}", bindaddress, CONTROLLER_INTERNAL_PORT))
    .context(controller_error::HttpServerSnafu)?
    .run();
    let server_handle = http_server.handle();

    let reconciler = Reconciler::new(
        K8SClusterClient::new(k8s_client.clone()),
        RolloutTarget::node_local_dns(),
        check::default_dependencies(),
        metrics.clone(),
    )
    .context(controller_error::ControllerSnafu)?;

    let elector = LeaderElector::new(k8s_client.clone(), &namespace, identity);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let leading = async {
        let mut acquire_cancel = cancel_rx.clone();
        tokio::select! {
            _ = elector.acquire() => {},
            _ = acquire_cancel.changed() => return Ok(()),
        }
        health.set_leader(true);

        let controller = SafeUpdaterController::new(
            k8s_client,
            reconciler,
            metrics,
            Arc::clone(&health),
        );
        // Losing the lease drops the controller, abandoning any pass in flight.
        tokio::select! {
            result = controller.run(cancel_rx.clone()) => result.context(controller_error::ControllerSnafu),
            result = elector.keep_renewing() => {
                health.set_leader(false);
                result.context(controller_error::ControllerSnafu)
            },
        }
    };
    tokio::pin!(leading);

    let mut sigterm = signal(SignalKind::terminate()).context(controller_error::SignalSnafu)?;

    let result = tokio::select! {
        result = &mut leading => {
            event!(Level::ERROR, "{} exited", SAFE_UPDATER);
            result
        },
        _ = http_server => {
            event!(Level::ERROR, "metric server exited");
            Ok(())
        },
        _ = sigterm.recv() => {
            event!(Level::INFO, "Received SIGTERM. Shutting down.");
            // Any in-flight reconcile pass observes the cancellation and stops issuing cluster calls.
            let _ = cancel_tx.send(true);
            (&mut leading).await
        },
        _ = tokio::signal::ctrl_c() => {
            event!(Level::INFO, "Received interrupt. Shutting down.");
            let _ = cancel_tx.send(true);
            (&mut leading).await
        },
    };

    server_handle.stop(true).await;
    result
}

pub mod controller_error {
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create Kubernetes client config: '{}'", source))]
        ConfigCreate {
            source: kube::config::InClusterError,
        },

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Error running safe updater: '{}'", source))]
        Controller { source: safe_updater::Error },

        #[snafu(display("Unable to get own pod name: '{}'", source))]
        GetPodName { source: std::env::VarError },

        #[snafu(display("Error determining the cluster server address: '{}'", source))]
        MissingClusterIPFamily { source: std::env::VarError },

        #[snafu(display("Error running HTTP server: '{}'", source))]
        HttpServer { source: std::io::Error },

        #[snafu(display("Unable to create prometheus exporter: '{}'", source))]
        PrometheusExporter {
            source: opentelemetry::metrics::MetricsError,
        },

        #[snafu(display("Unable to install signal handler: '{}'", source))]
        Signal { source: std::io::Error },

        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },
    }
}
