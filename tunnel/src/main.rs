mod relay;

use std::net::SocketAddr;
use std::path::PathBuf;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, Level};
use transport::secure::{accept_tls, connect_tls, self_signed_identity, server_config, TlsAcceptor};
use transport::{dial, Connection, Listener, Profile};

/// Relays TCP connections through the reliable UDP transport
#[derive(Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// TOML file with transport settings, defaults are used for missing settings
    #[clap(long, global = true)]
    profile: Option<PathBuf>,

    /// Runs TLS between tunnel client and server. The server uses a self-signed certificate, which
    ///  the client does not verify.
    #[clap(long, default_value_t = false, global = true)]
    tls: bool,

    #[clap(short, long, default_value_t = false, global = true)]
    verbose: bool,

    #[clap(long, default_value_t = false, global = true)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Accepts TCP connections and forwards each of them to a tunnel server
    Client {
        server_addr: SocketAddr,
        listen_addr: SocketAddr,
    },
    /// Accepts tunnel connections and forwards each of them to a TCP target
    Server {
        bind_addr: SocketAddr,
        target_addr: SocketAddr,
    },
    /// Prints the effective transport settings
    Profile,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let profile = match &args.profile {
        Some(path) => Profile::load(path)?,
        None => Profile::default(),
    };

    match args.mode {
        Mode::Client { server_addr, listen_addr } => run_client(server_addr, listen_addr, profile, args.tls).await,
        Mode::Server { bind_addr, target_addr } => run_server(bind_addr, target_addr, profile, args.tls).await,
        Mode::Profile => {
            println!("{}", profile);
            Ok(())
        }
    }
}

async fn run_client(server_addr: SocketAddr, listen_addr: SocketAddr, profile: Profile, tls: bool) -> anyhow::Result<()> {
    let tcp_listener = TcpListener::bind(listen_addr).await
        .with_context(|| format!("binding TCP listener to {:?}", listen_addr))?;
    info!("accepting TCP connections on {:?}, tunneling to {:?}", listen_addr, server_addr);

    loop {
        let (tcp, from) = tcp_listener.accept().await?;
        info!("accepted TCP connection from {:?}", from);

        let profile = profile.clone();
        tokio::spawn(async move {
            let connection = match dial(server_addr, profile).await {
                Ok(connection) => connection,
                Err(e) => {
                    error!("unable to connect to tunnel server {:?}: {}", server_addr, e);
                    return;
                }
            };
            if tls {
                match connect_tls(connection.clone()).await {
                    Ok(stream) => relay::relay_stream(tcp, stream, connection).await,
                    Err(e) => {
                        error!("{:#}", e);
                        connection.abort().await;
                    }
                }
            }
            else {
                relay::relay(tcp, connection).await;
            }
        });
    }
}

async fn run_server(bind_addr: SocketAddr, target_addr: SocketAddr, profile: Profile, tls: bool) -> anyhow::Result<()> {
    let acceptor = if tls {
        let identity = self_signed_identity(vec!["localhost".to_string(), bind_addr.ip().to_string()])?;
        Some(TlsAcceptor::from(server_config(identity)?))
    }
    else {
        None
    };

    let listener = Listener::bind(bind_addr, profile).await?;
    info!("accepting tunnel connections on {:?}, forwarding to {:?}", listener.local_addr(), target_addr);

    loop {
        let connection = listener.accept().await?;
        info!("accepted tunnel connection from {:?}", connection.peer_addr());

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => {
                    let stream = match accept_tls(&acceptor, connection.clone()).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("{:#}", e);
                            connection.abort().await;
                            return;
                        }
                    };
                    if let Some(tcp) = connect_target(target_addr, &connection).await {
                        relay::relay_stream(tcp, stream, connection).await;
                    }
                }
                None => {
                    if let Some(tcp) = connect_target(target_addr, &connection).await {
                        relay::relay(tcp, connection).await;
                    }
                }
            }
        });
    }
}

async fn connect_target(target_addr: SocketAddr, connection: &Connection) -> Option<TcpStream> {
    match TcpStream::connect(target_addr).await {
        Ok(tcp) => Some(tcp),
        Err(e) => {
            error!("unable to connect to {:?}: {}", target_addr, e);
            connection.abort().await;
            None
        }
    }
}
