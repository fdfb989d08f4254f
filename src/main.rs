#[tokio::main]
async fn main() {
    if let Err(error) = wa_orchestrator::run().await {
        eprintln!("fatal: {error}");
        std::process::exit(1);
    }
}
