use std::{env, net::SocketAddr, time::Duration};

use howlmesh_p2p::MemoryBroker;
use howlmesh_relay::{app, SERVICE_NAME};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_HISTORY: usize = 256;
const PRUNE_EVERY: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(SERVICE_NAME);

    let bind_addr = env::var("RELAY_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let history = match env::var("RELAY_HISTORY") {
        Ok(raw) => raw.trim().parse()?,
        Err(_) => DEFAULT_HISTORY,
    };
    let socket_addr: SocketAddr = bind_addr.parse()?;

    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    info!(%socket_addr, history, "relay listening");

    let broker = MemoryBroker::with_history(history);
    let pruner = broker.spawn_pruner(PRUNE_EVERY);

    axum::serve(listener, app(broker))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pruner.abort();

    global::shutdown_tracer_provider();
    Ok(())
}

fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("howlmesh_relay=info,howlmesh_p2p=info,tower_http=info")
    });
    let fmt_layer = tracing_subscriber::fmt::layer().compact().with_target(false);

    if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_owned()),
                ])),
            )
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio);

        match provider {
            Ok(provider) => {
                let tracer = provider.tracer(service_name.to_owned());
                global::set_tracer_provider(provider);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                info!("tracing initialized with OpenTelemetry OTLP exporter");
                return;
            }
            Err(error) => {
                eprintln!("failed to initialize OTLP exporter: {error}");
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    info!("tracing initialized (stdout only)");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
