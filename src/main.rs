#[tokio::main]
async fn main() {
    if let Err(error) = scada_dashboard_lib::run().await {
        eprintln!("scada-dashboard failed: {error}");
        std::process::exit(1);
    }
}
