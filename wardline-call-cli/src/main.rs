//! Wardline Call CLI Application

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wardline_call_core::prelude::*;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Portal base URL
    #[arg(long, env = "WARDLINE_PORTAL_URL", default_value = "http://127.0.0.1:8080")]
    portal_url: String,

    /// User id presented to the portal
    #[arg(long, env = "WARDLINE_USER_ID")]
    user_id: String,

    /// Display name shown to the other participant
    #[arg(long, env = "WARDLINE_USER_NAME")]
    user_name: String,

    /// Join with the microphone only
    #[arg(long)]
    no_video: bool,

    /// Join without capturing any local media
    #[arg(long)]
    no_audio: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a call and print the code to share
    Create,

    /// Join a call by code
    Join {
        /// Call code shared by the creator
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wardline=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = CallConfig::new(&cli.portal_url);
    config.constraints = MediaConstraints {
        audio: !cli.no_audio,
        video: !cli.no_video,
    };

    let manager = CallManager::new(config)?;
    let caller = CallerProfile::new(&cli.user_id, &cli.user_name);

    let session = match cli.command {
        Commands::Create => {
            let session = manager.create_call(&caller).await?;
            println!("📞 Call created");
            println!("   Share this code: {}", session.call_id());
            session
        }
        Commands::Join { code } => {
            let session = manager.join_call(&code, &caller).await?;
            println!("📞 Joined call {}", session.call_id());
            session
        }
    };

    println!("   Press Ctrl-C to leave");

    let mut events = session.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::StateChanged { state }) => {
                        println!("🔁 State: {state:?}");
                        if state.is_terminal() {
                            break;
                        }
                    }
                    Ok(SessionEvent::MediaUnavailable { reason }) => {
                        println!("🎤 Continuing without local media: {reason}");
                    }
                    Ok(SessionEvent::RemoteTrack { id, kind }) => {
                        println!("🎥 Remote {kind} track: {id}");
                    }
                    Ok(SessionEvent::ParticipantLeft) => {
                        println!("👋 The other participant left");
                    }
                    Ok(SessionEvent::CallEnded) => {
                        println!("📴 The call was ended");
                    }
                    Err(e) => {
                        tracing::error!("Event stream error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("👋 Leaving...");
                break;
            }
        }
    }

    manager.leave_call().await;
    // The creator's end-call request is detached; give it a beat before
    // the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    println!("📞 Call over");
    Ok(())
}
