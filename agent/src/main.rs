use anyhow::Result;
use clap::Parser;
use spider_agent::{Agent, AgentConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive("spider_agent=info".parse().unwrap());
    let json = std::env::var("SPIDER_LOG_JSON").as_deref() == Ok("1");
    if json {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    }
}

/// Thin CLI over the agent library's four public entry points. No
/// history, no completion, no scripting — a richer interactive shell is
/// explicitly out of scope.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = AgentConfig::parse();
    let agent = Agent::connect(config).await?;

    println!("connected. commands: connect <id> | send <id> <text> | peers | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or("") {
            "connect" => {
                let Some(id) = parts.next() else {
                    println!("usage: connect <id>");
                    continue;
                };
                if let Err(e) = agent.connect_to_peer(id).await {
                    println!("error: {e}");
                }
            }
            "send" => {
                let (Some(id), Some(text)) = (parts.next(), parts.next()) else {
                    println!("usage: send <id> <text>");
                    continue;
                };
                if let Err(e) = agent.send_message(id, text).await {
                    println!("error: {e}");
                }
            }
            "peers" => {
                for id in agent.list_peers() {
                    println!("{id}");
                }
            }
            "quit" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }

    agent.close();
    Ok(())
}
