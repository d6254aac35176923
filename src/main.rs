#[tokio::main]
async fn main() -> anyhow::Result<()> {
    query_pulse_lib::run().await
}
