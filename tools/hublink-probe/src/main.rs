// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! hublink-probe: command-line poke-and-watch tool for hub services.
//!
//! Three subcommands:
//!   probe <port>              check whether a service answers on a port
//!   call  <port> <code> [json] send one request, print the response
//!   watch [service_id]        print events from the bus as they arrive

use std::sync::Arc;
use std::time::Duration;

use hublink::eventbus;
use hublink::protocol::{Event, IpcCode, IpcMessage};
use hublink::rpc;

const CALL_TIMEOUT_SECS: u64 = 5;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let code = match args.get(1).map(String::as_str) {
        Some("probe") => cmd_probe(&args[2..]),
        Some("call") => cmd_call(&args[2..]),
        Some("watch") => cmd_watch(&args[2..]),
        _ => {
            usage();
            2
        }
    };
    std::process::exit(code);
}

fn usage() {
    eprintln!("hublink-probe: poke-and-watch tool for hub services");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  hublink-probe probe <port>");
    eprintln!("  hublink-probe call <port> <code> [json-payload]");
    eprintln!("  hublink-probe watch [service-id]");
}

fn parse_or_exit<T: std::str::FromStr>(arg: Option<&String>, what: &str) -> Option<T> {
    match arg {
        Some(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                eprintln!("[FAIL] Invalid {}: {}", what, raw);
                None
            }
        },
        None => {
            eprintln!("[FAIL] Missing {}", what);
            None
        }
    }
}

fn cmd_probe(args: &[String]) -> i32 {
    let Some(port) = parse_or_exit::<u16>(args.first(), "port") else {
        usage();
        return 2;
    };

    if rpc::is_service_available(port) {
        println!("[OK] Service is listening on port {}", port);
        0
    } else {
        println!("[FAIL] Nothing answers on port {}", port);
        1
    }
}

fn cmd_call(args: &[String]) -> i32 {
    let Some(port) = parse_or_exit::<u16>(args.first(), "port") else {
        usage();
        return 2;
    };
    let Some(code) = parse_or_exit::<u32>(args.get(1), "request code") else {
        usage();
        return 2;
    };

    let request = match args.get(2) {
        Some(raw) => {
            // Validate the payload is JSON before putting it on the wire.
            if serde_json::from_str::<serde_json::Value>(raw).is_err() {
                eprintln!("[FAIL] Payload is not valid JSON");
                return 2;
            }
            IpcMessage::with_payload(code, raw.clone().into_bytes())
        }
        None => IpcMessage::new(code),
    };

    println!(
        "Calling port {} with code {} ({} payload bytes)...",
        port,
        code,
        request.payload_len()
    );

    match rpc::send_service_request_timeout(port, &request, CALL_TIMEOUT_SECS) {
        Ok(response) => {
            print!("Response code {}", response.code);
            if let Some(ipc_code) = IpcCode::from_u32(response.code) {
                print!(" ({})", ipc_code.label());
            }
            println!();
            if let Some(text) = response.payload_str() {
                println!("{}", text);
            }
            0
        }
        Err(e) => {
            eprintln!("[FAIL] {}", e);
            1
        }
    }
}

fn cmd_watch(args: &[String]) -> i32 {
    let service_id = match args.first() {
        Some(_) => match parse_or_exit::<i32>(args.first(), "service id") {
            Some(id) => id,
            None => {
                usage();
                return 2;
            }
        },
        None => eventbus::SUBSCRIBE_ALL,
    };

    let handler: Arc<dyn eventbus::EventHandler> = Arc::new(|event: &Event| {
        match event.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("[FAIL] Cannot re-serialize event: {}", e),
        }
    });

    if !eventbus::start_event_listener(service_id, handler) {
        eprintln!("[FAIL] Could not start the event listener");
        return 1;
    }

    if service_id == eventbus::SUBSCRIBE_ALL {
        println!("Watching all events (Ctrl-C to stop)...");
    } else {
        println!("Watching events from service {} (Ctrl-C to stop)...", service_id);
    }

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
