use anyhow::Result;
use lmchat::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
