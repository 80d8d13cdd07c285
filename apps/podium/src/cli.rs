use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::ids::{self, ClientKind};
use crate::messages::{ClientMessage, ClientSummary, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "podium")]
#[command(about = "Ensemble coordination server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe a running server over its signaling WebSocket
    Debug {
        /// Server URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Print the current active controller
    Active,
    /// Print the synth list as a controller sees it
    Clients,
}

enum Reply {
    Active(Option<String>),
    Clients(Vec<ClientSummary>),
}

/// Connects as a throwaway probe client and prints the server's answer.
/// Probe records are short-lived: TTL and the reaper clean them up.
pub async fn run_debug_client(url: String, command: DebugCommands) -> Result<()> {
    let ws_url = format!("{}/signal", url.trim_end_matches('/'));

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(anyhow::anyhow!("connection failed: {err}")),
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the server running at {ws_url}?"
            ))
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let kind = match command {
        DebugCommands::Active => ClientKind::Synth,
        DebugCommands::Clients => ClientKind::Controller,
    };
    let probe_id = ids::mint_client_id(kind);
    debug!(probe = %probe_id, "registering debug probe");

    let register = ClientMessage::Register {
        id: probe_id.clone(),
        client_type: Some(kind.as_str().to_string()),
        is_reconnect: false,
        timestamp: None,
    };
    write
        .send(Message::Text(serde_json::to_string(&register)?))
        .await?;

    // Registration pushes the answer unprompted: the current leader for
    // synth probes, the client list for controller probes.
    let wanted_clients = matches!(command, DebugCommands::Clients);
    let reply = timeout(Duration::from_secs(10), async {
        while let Some(msg) = read.next().await {
            let Message::Text(text) = msg? else { continue };
            match serde_json::from_str::<ServerMessage>(&text)? {
                ServerMessage::ActiveController { controller_id, .. } if !wanted_clients => {
                    return Ok::<_, anyhow::Error>(Reply::Active(controller_id));
                }
                ServerMessage::ClientList { clients } if wanted_clients => {
                    return Ok(Reply::Clients(clients));
                }
                ServerMessage::Error { message } => {
                    return Err(anyhow::anyhow!("server error: {message}"));
                }
                _ => {}
            }
        }
        Err(anyhow::anyhow!("connection closed before reply"))
    })
    .await;

    let reply = match reply {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => return Err(err),
        Err(_) => return Err(anyhow::anyhow!("timeout waiting for server reply")),
    };

    match reply {
        Reply::Active(Some(id)) => println!("active controller: {id}"),
        Reply::Active(None) => println!("active controller: none"),
        Reply::Clients(clients) if clients.is_empty() => println!("no synths registered"),
        Reply::Clients(clients) => {
            println!("{:<44} {:>9} {:>14} {:>10}", "ID", "CONNECTED", "PEER-CONNECTED", "RECONNECTS");
            for client in clients {
                println!(
                    "{:<44} {:>9} {:>14} {:>10}",
                    client.id, client.connected, client.peer_connected, client.reconnection_count
                );
            }
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}
