// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairbridge Control CLI
//!
//! CLI tool for pairing devices against a bridge backend.
//!
//! Usage:
//!   pairbridge-ctl <command> [options]
//!
//! Commands:
//!   health                        Check backend health and credential
//!   status <instance_id>          Show connection status
//!   pair <instance_id> [--name <name>] [--out <file.png>]
//!   disconnect <instance_id>      Log the device out

use std::process::ExitCode;

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use pairbridge_sdk::{HealthValidator, PairingConfig, PairingOrchestrator};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!(
        r#"Usage: pairbridge-ctl <command> [options]

Pair devices against a bridge backend.

COMMANDS:
    health                          Check backend health and credential
    status <instance_id>            Show connection status
    pair <instance_id>              Pair a device and wait until it connects
    disconnect <instance_id>        Log the device out

PAIR OPTIONS:
    --name <name>                   Display name used when creating the instance
    --out <file.png>                Write each issued pairing code to this file
                                    (default: <instance_id>.png)

ENVIRONMENT:
    PAIRBRIDGE_BACKEND_URL          Backend base URL (required)
    PAIRBRIDGE_API_KEY              Backend credential (required)
    PAIRBRIDGE_RELAY_URL            Relay endpoint
    PAIRBRIDGE_SECURE_HOST          Route insecure backends through the relay
    RUST_LOG                        Log filter (default: pairbridge_sdk=info)

EXAMPLES:
    # Check the backend
    pairbridge-ctl health

    # Pair a device, writing the QR code to store-42.png
    pairbridge-ctl pair store-42 --name "Store 42"
"#
    );
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Health,
    Status {
        instance_id: String,
    },
    Pair {
        instance_id: String,
        name: Option<String>,
        out: Option<String>,
    },
    Disconnect {
        instance_id: String,
    },
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        "health" => Ok(Command::Health),
        "status" => {
            let instance_id = args.get(2).ok_or("Instance ID required")?.clone();
            Ok(Command::Status { instance_id })
        }
        "pair" => {
            let instance_id = args.get(2).ok_or("Instance ID required")?.clone();
            let mut name: Option<String> = None;
            let mut out: Option<String> = None;

            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--name" => {
                        i += 1;
                        name = Some(args.get(i).ok_or("--name requires a value")?.clone());
                    }
                    "--out" => {
                        i += 1;
                        out = Some(args.get(i).ok_or("--out requires a path")?.clone());
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::Pair {
                instance_id,
                name,
                out,
            })
        }
        "disconnect" => {
            let instance_id = args.get(2).ok_or("Instance ID required")?.clone();
            Ok(Command::Disconnect { instance_id })
        }
        cmd => Err(format!("Unknown command: {}", cmd)),
    }
}

/// Decode a `data:image/png;base64,...` URI into PNG bytes.
fn decode_data_uri(uri: &str) -> anyhow::Result<Vec<u8>> {
    let (_, encoded) = uri
        .split_once(";base64,")
        .context("pairing code is not a base64 data URI")?;
    STANDARD
        .decode(encoded.trim())
        .context("pairing code is not valid base64")
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pairbridge_sdk=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cmd = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let config = match PairingConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = match PairingOrchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Failed to create orchestrator: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match execute_command(&orchestrator, cmd).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute_command(orchestrator: &PairingOrchestrator, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Health => {
            let validator = HealthValidator::new(
                orchestrator.client().clone(),
                orchestrator.config().health_timeout(),
            );
            let base_url = orchestrator.client().descriptor().base_url().to_string();
            validator.check().await.into_result(&base_url)?;
            println!("Backend at {} is healthy", base_url);
        }

        Command::Status { instance_id } => {
            let report = orchestrator.status(&instance_id).await?;
            println!("Instance:  {}", instance_id);
            println!("Connected: {}", report.connected);
            if let Some(state) = report.state {
                println!("State:     {}", state);
            }
            if let Some(phone) = report.phone_number {
                println!("Phone:     {}", phone);
            }
            println!(
                "Backend:   {}",
                orchestrator.client().descriptor().flavor().as_str()
            );
        }

        Command::Pair {
            instance_id,
            name,
            out,
        } => {
            let out = out.unwrap_or_else(|| format!("{}.png", instance_id));
            let name = name.unwrap_or_else(|| instance_id.clone());

            let session = orchestrator.start_connection(&instance_id, &name).await?;

            let mut state = session.state.clone();
            let writer = tokio::spawn(async move {
                let mut last_code: Option<String> = None;
                loop {
                    let code = state.borrow_and_update().qr_code.clone();
                    if code.is_some() && code != last_code {
                        if let Some(uri) = &code {
                            match decode_data_uri(uri).and_then(|png| {
                                std::fs::write(&out, png)
                                    .with_context(|| format!("failed to write {}", out))
                            }) {
                                Ok(()) => eprintln!("Scan the pairing code in {}", out),
                                Err(e) => eprintln!("Error: {:#}", e),
                            }
                        }
                        last_code = code;
                    }
                    if state.changed().await.is_err() {
                        break;
                    }
                }
            });

            let result = session.wait().await;
            writer.abort();

            let device = result?;
            println!("Paired instance {}", device.instance_id);
            if let Some(phone) = device.phone_number {
                println!("Phone: {}", phone);
            }
        }

        Command::Disconnect { instance_id } => {
            orchestrator.disconnect(&instance_id).await?;
            println!("Disconnected instance {}", instance_id);
        }
    }

    Ok(())
}
