use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use framelink::service::setup_tracing;
use framelink::{AppResult, Client, ClientOptions, FramelinkConfig, Server, ServerOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// run the echo server until ctrl-c
    Server {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// connect, send stdin lines and print what comes back
    Client {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    PrintConfig,
}

fn main() -> AppResult<()> {
    // load .env
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    if commandline.verbose > 0 && std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut config = FramelinkConfig::set_up_config(config_path)?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command {
        Some(Command::PrintConfig) => {
            println!("{:#?}", config);
            Ok(())
        }
        Some(Command::Client { host, port }) => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            let _guard = setup_tracing(&config.log)?;
            rt.block_on(run_client(&config))
        }
        Some(Command::Server { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let _guard = setup_tracing(&config.log)?;
            rt.block_on(run_server(&config))
        }
        None => {
            let _guard = setup_tracing(&config.log)?;
            rt.block_on(run_server(&config))
        }
    }
}

async fn run_server(config: &FramelinkConfig) -> AppResult<()> {
    let server = Server::start(ServerOptions::from_config(config)?).await?;
    info!("framelink server listening on {}", server.local_addr());
    server.run_until_ctrl_c().await
}

async fn run_client(config: &FramelinkConfig) -> AppResult<()> {
    let mut client = Client::connect(ClientOptions::from_config(config)?).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim() == "exit" => break,
                    Some(line) => {
                        if let Err(err) = client.send_message(&line).await {
                            error!("send failed: {}", err);
                            break;
                        }
                    }
                    None => break,
                }
            }
            received = client.recv() => {
                match received {
                    Some(text) => println!("{}", text),
                    None => break,
                }
            }
        }
    }

    client.close().await;
    Ok(())
}
