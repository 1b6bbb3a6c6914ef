use anyhow::Result;
use spider_server::{Server, ServerConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive("spider_server=info".parse().unwrap());
    let json = std::env::var("SPIDER_LOG_JSON").as_deref() == Ok("1");
    if json {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ServerConfig::load()?;
    let server = Server::bind(config).await?;
    server.run().await
}
