//! The BitBox operator client.
//!
//! Connects to a daemon's client channel, authenticates with the identity's
//! private key, sends one command, and prints the decrypted response.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use bitbox_crypto::{
    decrypt_message, encrypt_message, load_private_key, unwrap_session_key, SessionKey,
};
use bitbox_proto::control::{ControlRequest, ControlResponse, Payload};
use bitbox_proto::HostPort;

/// Where the client looks for its RSA private key.
const PRIVATE_KEY_FILE: &str = "bitboxclient_rsa";

#[derive(Parser)]
#[command(name = "bitbox-cli")]
#[command(about = "Send a command to a running BitBox daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Command to run: list_peers, connect_peer, or disconnect_peer
    #[arg(short = 'c', long = "command")]
    command: String,

    /// Address of the daemon's client channel, host:port
    #[arg(short = 's', long = "server-address")]
    server: String,

    /// Peer to connect to or disconnect from, host:port
    #[arg(short = 'p', long = "peer-address")]
    peer: Option<String>,

    /// Identity to authenticate as
    #[arg(short = 'i', long = "identity")]
    identity: String,
}

fn build_request(command: &str, peer: Option<&str>) -> Result<ControlRequest> {
    let peer_host_port = |peer: Option<&str>| -> Result<HostPort> {
        let address = peer.context("missing command line option: -p")?;
        address
            .parse()
            .map_err(|_| anyhow!("invalid peer address: {}", address))
    };
    match command {
        "list_peers" => Ok(ControlRequest::ListPeers),
        "connect_peer" => {
            let target = peer_host_port(peer)?;
            Ok(ControlRequest::ConnectPeer {
                host: target.host,
                port: target.port,
            })
        }
        "disconnect_peer" => {
            let target = peer_host_port(peer)?;
            Ok(ControlRequest::DisconnectPeer {
                host: target.host,
                port: target.port,
            })
        }
        other => bail!("invalid command: {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();
    let request = build_request(&cli.command, cli.peer.as_deref())?;
    let server: HostPort = cli
        .server
        .parse()
        .map_err(|_| anyhow!("invalid server address: {}", cli.server))?;
    let private_key = load_private_key(Path::new(PRIVATE_KEY_FILE))
        .with_context(|| format!("failed reading private key {}", PRIVATE_KEY_FILE))?;

    let socket = TcpStream::connect((server.host.as_str(), server.port))
        .await
        .with_context(|| format!("failed to connect to {}", server))?;
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Authenticate.
    let auth = serde_json::to_string(&ControlRequest::Auth {
        identity: cli.identity.clone(),
    })?;
    write_half.write_all(auth.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;

    let Some(line) = lines.next_line().await? else {
        println!("No response");
        return Ok(());
    };
    let key = match serde_json::from_str::<ControlResponse>(&line) {
        Ok(ControlResponse::Auth {
            status: true,
            aes128: Some(wrapped),
            ..
        }) => unwrap_session_key(&wrapped, &private_key)
            .map_err(|e| anyhow!("could not unwrap session key: {}", e))?,
        Ok(ControlResponse::Auth {
            status: false,
            message,
            ..
        }) => {
            println!("Authentication failure: {}", message);
            return Ok(());
        }
        _ => {
            println!("Malformed response: {}", line);
            return Ok(());
        }
    };

    // Send the encrypted command and report the verdict.
    let response = send_command(&mut write_half, &mut lines, &key, &request).await?;
    println!("{}", response);
    Ok(())
}

async fn send_command(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    key: &SessionKey,
    request: &ControlRequest,
) -> Result<String> {
    let plain = serde_json::to_string(request)?;
    let envelope = Payload {
        payload: encrypt_message(key, &plain),
    };
    write_half
        .write_all(serde_json::to_string(&envelope)?.as_bytes())
        .await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;

    let Some(line) = lines.next_line().await? else {
        return Ok("No response".to_string());
    };
    let value: serde_json::Value = match serde_json::from_str(&line) {
        Ok(value) => value,
        Err(_) => return Ok(format!("Malformed response: {}", line)),
    };

    if let Some(payload) = value.get("payload").and_then(|p| p.as_str()) {
        let plain = decrypt_message(key, payload)
            .map_err(|e| anyhow!("could not decrypt response: {}", e))?;
        return Ok(plain);
    }
    // An unencrypted response is only legitimate as a failure report.
    match value.get("status").and_then(|s| s.as_bool()) {
        Some(false) => {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default();
            Ok(format!("Failed response: {}", message))
        }
        _ => Ok(format!("Malformed response: {}", line)),
    }
}
