#[macro_use]
extern crate log;

use std::sync::Arc;

use csi_driver_operator_apis::{API_GROUP, API_VERSION, KIND};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio_util::sync::CancellationToken;

use assets::EmbeddedAssets;
use configuration::Configuration;
use controller_set::ControllerSet;
use controllers::ClusterAccess;
use events::{EventRecorder, KubeEventRecorder};
use operator_state::OperatorStateAccessor;
use prometheus_exporter::start_prometheus_metrics_server;
use store::{KubeObjectCache, KubeObjectStore};

mod assets;
mod configuration;
mod controller_set;
mod controllers;
mod errors;
mod events;
#[cfg(test)]
mod fake;
mod hooks;
mod managed_fields;
mod operator_state;
mod predicates;
mod prometheus_exporter;
mod starter;
mod store;
mod utils;

/// Reporting controller of the events emitted by the operator.
const OPERATOR_NAME: &'static str = "ibm-vpc-block-csi-driver-operator";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let config = Configuration::from_env()?;

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());
    let metrics_server = start_prometheus_metrics_server(config.metrics_socket_addr()?, registry);

    let client = Client::try_default().await?;
    let (cache, cache_driver) = starter::watches(&config)
        .into_iter()
        .fold(KubeObjectCache::builder(client.clone()), |builder, watch| {
            builder.watch(watch)
        })
        .build();
    let store = Arc::new(KubeObjectStore::new(client.clone()));
    let state = Arc::new(OperatorStateAccessor::new(
        store.clone(),
        cache.clone(),
        &config.instance_name,
    ));
    let recorder = Arc::new(KubeEventRecorder::new(
        client,
        OPERATOR_NAME,
        ObjectReference {
            api_version: Some(format!("{}/{}", API_GROUP, API_VERSION)),
            kind: Some(KIND.to_string()),
            name: Some(config.instance_name.clone()),
            ..Default::default()
        },
    ));

    let mut controller_set =
        ControllerSet::new(state.clone(), cache.clone(), recorder.clone(), config.resync);
    starter::register_all(
        &mut controller_set,
        starter::controllers(
            &config,
            ClusterAccess::new(store, cache),
            state,
            Arc::new(EmbeddedAssets),
        ),
    )?;

    info!("start controllers ...");
    let token = CancellationToken::new();
    let handle = controller_set.run(token.clone(), config.workers);
    recorder.record(
        "OperatorStarted",
        format!("{} started for {}", OPERATOR_NAME, config.instance_name),
    );
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
        _ = cache_driver => warn!("object cache stopped"),
        result = metrics_server => {
            if let Err(e) = result {
                error!("metrics server failed: {}", e);
            }
        },
    };
    token.cancel();
    handle.join().await;
    if let Err(e) = meter_provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    info!("stopped");
    Ok(())
}
