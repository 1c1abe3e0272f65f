#![forbid(unsafe_code)]

//! `kernel-ctl`: local CLI companion for `kernel-orchestrator`.
//!
//! Connects to the kernel's IPC socket, sends one request, and prints the
//! frames the kernel emits for it until the request is complete.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "kernel-ctl",
    about = "Local CLI for a running kernel-orchestrator",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the kernel's `ipc_name` config).
    #[arg(long, default_value = "kernel-orchestrator")]
    ipc_name: String,

    /// Session identifier stamped on the request.
    #[arg(long, default_value = "kernel-ctl")]
    session: String,

    /// Print raw frames instead of a readable transcript.
    #[arg(long)]
    raw: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a cell and stream its output.
    Execute {
        /// Cell source.
        code: String,
    },

    /// Interrupt the running cell.
    Interrupt,

    /// Print kernel metadata.
    KernelInfo,

    /// List open comms.
    CommInfo,

    /// Stop the kernel.
    Shutdown {
        /// Ask for a restart instead of a plain shutdown.
        #[arg(long)]
        restart: bool,
    },
}

impl Command {
    fn msg_type(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute_request",
            Self::Interrupt => "interrupt_request",
            Self::KernelInfo => "kernel_info_request",
            Self::CommInfo => "comm_info_request",
            Self::Shutdown { .. } => "shutdown_request",
        }
    }

    fn content(&self) -> Value {
        match self {
            Self::Execute { code } => json!({ "code": code, "silent": false }),
            Self::Shutdown { restart } => json!({ "restart": restart }),
            Self::Interrupt | Self::KernelInfo | Self::CommInfo => json!({}),
        }
    }
}

fn main() {
    let args = Cli::parse();
    let msg_id = uuid::Uuid::new_v4().to_string();
    let request = json!({
        "header": {
            "msg_id": msg_id,
            "msg_type": args.command.msg_type(),
            "session": args.session,
            "username": "kernel-ctl",
            "date": chrono::Utc::now().to_rfc3339(),
            "version": "5.3",
        },
        "parent_header": null,
        "metadata": {},
        "content": args.command.content(),
    });
    let waits_for_idle = matches!(args.command, Command::Execute { .. });

    if let Err(err) = exchange(&args.ipc_name, &request, &msg_id, waits_for_idle, args.raw) {
        eprintln!("Failed to talk to kernel: {err}");
        eprintln!("Is kernel-orchestrator running with ipc_name '{}'?", args.ipc_name);
        std::process::exit(1);
    }
}

/// Send `request` and print frames answering it.
///
/// Execute requests finish on the `idle` status for the request; every
/// other request finishes on its shell reply.
fn exchange(
    ipc_name: &str,
    request: &Value,
    msg_id: &str,
    waits_for_idle: bool,
    raw: bool,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let reader = BufReader::new(&stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: Value = serde_json::from_str(&line)?;
        let message = &frame["message"];
        if message["parent_header"]["msg_id"].as_str() != Some(msg_id) {
            continue;
        }

        if raw {
            println!("{line}");
        } else {
            print_message(message);
        }

        let msg_type = message["header"]["msg_type"].as_str().unwrap_or_default();
        let channel = frame["channel"].as_str().unwrap_or_default();
        let done = if waits_for_idle {
            msg_type == "status" && message["content"]["execution_state"] == "idle"
        } else {
            channel == "shell"
        };
        if done {
            break;
        }
    }
    Ok(())
}

fn print_message(message: &Value) {
    let content = &message["content"];
    match message["header"]["msg_type"].as_str().unwrap_or_default() {
        "stream" => {
            let text = content["text"].as_str().unwrap_or_default();
            if content["name"] == "stderr" {
                eprint!("{text}");
            } else {
                print!("{text}");
            }
        }
        "execute_result" => {
            if let Some(text) = content["data"]["text/plain"].as_str() {
                println!("Out[{}]: {text}", content["execution_count"]);
            }
        }
        "error" => eprintln!(
            "{}: {}",
            content["ename"].as_str().unwrap_or_default(),
            content["evalue"].as_str().unwrap_or_default()
        ),
        "status" | "execute_input" | "execute_reply" => {}
        _ => println!(
            "{}",
            serde_json::to_string_pretty(content).unwrap_or_default()
        ),
    }
}
