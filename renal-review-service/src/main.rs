use std::sync::Arc;
use std::time::Duration;

use clinical_core::KnowledgeCache;
use renal_review_service::create_app;
use renal_review_service::llm::OpenRouterDecisionModel;
use tokio::net::TcpListener;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_KNOWLEDGE_PATH: &str = "data/knowledge_base.json";
const DEFAULT_KNOWLEDGE_TTL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let model = match OpenRouterDecisionModel::from_env() {
        Ok(model) => model,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let knowledge_path = std::env::var("KNOWLEDGE_BASE_PATH")
        .unwrap_or_else(|_| DEFAULT_KNOWLEDGE_PATH.to_string());
    let knowledge_ttl = std::env::var("KNOWLEDGE_TTL_SECS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_KNOWLEDGE_TTL_SECS);

    let knowledge = Arc::new(KnowledgeCache::new(
        knowledge_path,
        Duration::from_secs(knowledge_ttl),
    ));
    // Fail fast on a broken knowledge file; later reload failures keep the
    // last good snapshot
    knowledge.get().await?;

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u16>()
        .unwrap_or(3000);

    let app = create_app(knowledge, Arc::new(model));
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    let addr = listener.local_addr()?;

    info!("Renal Claims Review Service starting on {}", addr);
    info!("Health check endpoint: http://{}/health", addr);
    info!("Analysis endpoint: POST http://{}/documents/analyze", addr);
    info!("Decision endpoint: POST http://{}/decisions", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
