use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use tokio::io::AsyncWriteExt;
use url::Url;
use web_transport_echo::{echo, ClientBuilder, ServerBuilder, Session, Shutdown};

/// Start an echo server, open a session to it and echo one message.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the server listens on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Server identity; generated when absent.
    #[arg(long)]
    secret_key: Option<iroh::SecretKey>,

    #[arg(short, long, default_value = "Hello, world!")]
    message: String,

    /// Seconds allowed for connecting and opening the session.
    #[arg(long, default_value = "10")]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable info logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut builder = ServerBuilder::new();
    if let Some(addr) = args.addr {
        builder = builder.with_addr(addr);
    }
    if let Some(secret_key) = args.secret_key {
        builder = builder.with_secret_key(secret_key);
    }

    let server = builder.build().await?;
    for path in echo::PATHS {
        server.route(path, |session: &Session| {
            session.on_terminated(|code, reason| {
                tracing::info!("server session closed with error code {code}: {reason}");
            });
            echo::serve(session);
        });
    }
    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    tracing::info!("listening as {}", server.endpoint_id());

    let client = ClientBuilder::new()
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .build()
        .await?;

    let mut shutdown = Shutdown::new()
        .with_server(server.clone())
        .with_client(client.clone());

    let res = async {
        let conn = client.connect(server.endpoint_addr()).await?;
        let url: Url = format!("https://{}/echo", server.endpoint_id()).parse()?;

        let session = conn
            .create_session(url)
            .on_terminated(|code, reason| {
                tracing::info!("client session closed with error code {code}: {reason}");
            })
            .open()
            .await?;
        shutdown.track(&session);
        tracing::info!("session {} opened", session.id());

        let reply = echo::round_trip(&session, args.message.as_bytes()).await?;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(&reply).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;

        anyhow::Ok(())
    }
    .await;

    shutdown.finish(res).await
}
