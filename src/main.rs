use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fetchbridge::{
    config::Config,
    fetch::{Payload, ProxyRequest, ResponseType, build_http_client, ensure_rustls_crypto_provider},
    logging,
    rpc::{self, Envelope},
    server,
};
use hyper::Uri;

#[derive(Debug, Parser)]
#[command(name = "fetchbridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the RPC front door and capture pipeline.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Send a one-shot proxied fetch to a running server.
    Fetch {
        /// URL to fetch through the proxy.
        url: String,
        /// RPC endpoint of the running server, e.g. `http://127.0.0.1:7733/rpc`.
        #[arg(long)]
        endpoint: Option<Uri>,
        /// Optional path to config TOML, used to derive the endpoint.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Request header as `name: value`; repeatable.
        #[arg(long = "header")]
        headers: Vec<String>,
        /// Request body sent as text.
        #[arg(long)]
        body: Option<String>,
        /// Force the response decoding (json, text, arrayBuffer).
        #[arg(long)]
        response_type: Option<String>,
        /// Include response headers in the output.
        #[arg(long)]
        include_headers: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let server = server::serve(&config).await?;
            eprintln!(
                "{}",
                startup_summary(&config, server.listen_addr, server.bridge_addr)
            );
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
        Command::Fetch {
            url,
            endpoint,
            config,
            method,
            headers,
            body,
            response_type,
            include_headers,
        } => {
            let endpoint = match endpoint {
                Some(endpoint) => endpoint,
                None => {
                    let config = Config::load(config.as_deref())?;
                    format!("http://{}/rpc", config.server.listen).parse()?
                }
            };
            let headers = headers
                .iter()
                .map(|raw| parse_header(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let response_type = response_type
                .as_deref()
                .map(parse_response_type)
                .transpose()?;
            let request = ProxyRequest {
                url,
                method,
                headers,
                body: body.map(Payload::Text).unwrap_or_default(),
                response_type,
                include_headers,
                correlation_id: None,
            };

            ensure_rustls_crypto_provider()?;
            let client = build_http_client()?;
            let response =
                rpc::call_one_shot(&client, &endpoint, &Envelope::BackgroundFetch(request)).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                anyhow::bail!(
                    "rpc call failed: {}",
                    response.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    Ok(())
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid header `{raw}`; expected `name: value`"))?;
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}

fn parse_response_type(raw: &str) -> anyhow::Result<ResponseType> {
    match raw {
        "json" => Ok(ResponseType::Json),
        "text" => Ok(ResponseType::Text),
        "arrayBuffer" => Ok(ResponseType::ArrayBuffer),
        other => anyhow::bail!(
            "invalid response type `{other}`; expected json, text, or arrayBuffer"
        ),
    }
}

fn startup_summary(
    config: &Config,
    listen_addr: std::net::SocketAddr,
    bridge_addr: Option<std::net::SocketAddr>,
) -> String {
    let storage_path = config
        .storage
        .as_ref()
        .map(|storage| storage.path.display().to_string())
        .unwrap_or_else(|| "disabled".to_owned());
    let auth = if config.auth.is_some() {
        "enabled"
    } else {
        "disabled"
    };
    let bridge = bridge_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "disabled".to_owned());

    format!(
        "startup config: rpc_listen={}, bridge_listen={}, auth={}, storage_path={}, signal_buffer={}",
        listen_addr,
        bridge,
        auth,
        storage_path,
        config.signal_buffer()
    )
}
