use session_telemetry::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::main().await
}
