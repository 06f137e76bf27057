#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gitaly_ops::run_from_env().await
}
