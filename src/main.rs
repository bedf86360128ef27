use llm_event_bus::{
    config::{Config, ObservabilityConfig},
    messaging::{Message, MessageContext, NatsBroker, Subscriber},
    metrics::PrometheusMetrics,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing
    init_tracing(&config.observability);

    tracing::info!("Starting LLM Event Bus v{}", env!("CARGO_PKG_VERSION"));

    let metrics = Arc::new(PrometheusMetrics::with_default_tags(
        &config.observability.metrics_namespace,
        config.observability.default_tags.clone(),
    ));

    // The host owns the connection; publishers and subscribers only borrow it
    let broker = Arc::new(NatsBroker::connect(&config.nats).await?);
    tracing::info!("✅ NATS connection established");

    let subscriber = Subscriber::new(broker.clone(), config.subscriber.clone())?.with_metrics(metrics.clone());
    let ctx = MessageContext::new();

    if config.host.subjects.is_empty() {
        tracing::warn!("⚠️  No subjects configured under [host]; nothing to consume");
    }

    let handles: Vec<_> = config
        .host
        .subjects
        .iter()
        .map(|subject| {
            let subscriber = subscriber.clone();
            let ctx = ctx.clone();
            let subject = subject.clone();
            tokio::spawn(async move {
                let result = subscriber
                    .consume(&ctx, &subject, |ctx: MessageContext, message: Message| async move {
                        tracing::info!(
                            subject = %message.subject,
                            message_id = ctx.message_id().unwrap_or_default(),
                            bytes = message.payload.len(),
                            payload = %String::from_utf8_lossy(&message.payload),
                            "Message received"
                        );
                        anyhow::Ok(())
                    })
                    .await;

                if let Err(e) = result {
                    tracing::error!(subject = %subject, error = %e, "Subscription failed");
                }
            })
        })
        .collect();

    tracing::info!(subscriptions = handles.len(), mode = ?config.subscriber.mode, "✅ Subscriptions started");
    tracing::info!("Press Ctrl+C to shutdown");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutdown signal received, draining subscriptions...");
    ctx.cancel();
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Subscription task panicked");
        }
    }

    broker.shutdown().await?;
    tracing::debug!(metrics = %metrics.render(), "Final metrics");
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_filter));
    let registry = tracing_subscriber::registry().with(filter);

    if observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
