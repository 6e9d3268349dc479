/// Entry point for the Sense agent.
///
/// Attaches kernel instrumentation, attributes the observed events to
/// containers and serves per-container connection statistics over HTTP.
///
/// # Errors
///
/// Returns an error if initialization fails (e.g., invalid environment
/// variables, an unsupported kernel, or missing kernel tracing).
///
/// # Examples
///
/// ```bash
/// RUST_LOG=info SENSE_API_LISTEN=127.0.0.1:3000 sense-agent
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    sense_agent::run().await
}
