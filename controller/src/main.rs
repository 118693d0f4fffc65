mod host;
mod supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
