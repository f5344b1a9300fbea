use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (ARBOR_LOG_JSON=1), human-readable
    // otherwise.
    let json_logs = std::env::var("ARBOR_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("arbor_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = arbor_server::config::ServerConfig::parse();
    config.load_network()?;
    tracing::info!(
        server = %config.server_name,
        sid = %config.sid,
        links = config.network.link.len(),
        "starting spanning-tree server on {}",
        config.listen_addr
    );
    if let Some(ref tls_addr) = config.tls_listen_addr {
        tracing::info!("TLS links enabled on {tls_addr}");
    }

    let server = arbor_server::server::Server::new(config);
    server.run().await
}
