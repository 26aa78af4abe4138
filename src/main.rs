#[tokio::main]
async fn main() {
    if let Err(err) = recovery_server::app::run().await {
        eprintln!("recovery-server failed: {err:#}");
        std::process::exit(1);
    }
}
