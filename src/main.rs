/// flowgate server entry point
///
/// Serves:
/// - Workflow management API at /api/workflows/*
/// - Webhook triggers at /webhook/{token}
/// - Run status and live events at /api/executions/*
/// - Health check at /healthz

use flowgate::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults overridden by FLOWGATE_* environment variables
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
