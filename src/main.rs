//! Interactive command-line front-end for the ARIES/LYNX driver.
//!
//! Usage: `aries-cli <host> <port> [auto_reconnect]`
//!
//! Reads commands from stdin (`help` lists them), prints connection
//! transitions and move completions as they happen, and traps Ctrl+C as a
//! stop request. Exits 0 on a clean `quit`, 1 on unrecoverable startup
//! failure.

use anyhow::Context;
use chrono::Local;
use kohzu_aries::config::DriverConfig;
use kohzu_aries::controller::AriesManager;
use kohzu_aries::error::AriesResult;
use kohzu_aries::protocol::{error_text, Reply};
use log::info;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

fn usage() {
    eprintln!("Usage: aries-cli <host> <port> [auto_reconnect(0|1|true|false|yes|no)]");
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_args() -> anyhow::Result<DriverConfig> {
    let mut args = std::env::args().skip(1);
    let host = args.next().context("missing <host>")?;
    let port: u16 = args
        .next()
        .context("missing <port>")?
        .parse()
        .context("invalid <port>")?;
    let auto_reconnect = match args.next() {
        Some(flag) => parse_bool(&flag).context("invalid auto_reconnect flag")?,
        None => false,
    };
    Ok(DriverConfig {
        host,
        port,
        auto_reconnect,
        ..Default::default()
    })
}

fn now_stamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn print_help() {
    println!("Commands:");
    println!("  help                 show this help");
    println!("  connect              attempt a single connection now");
    println!("  start                start the manager (reconnect loop if enabled)");
    println!("  move abs <axis> <pos>    absolute move, pulse units");
    println!("  move rel <axis> <delta>  relative move, pulse units");
    println!("  poll set <a,b,c>     replace the polled axis list");
    println!("  poll add <axis>      add one axis to polling");
    println!("  poll rm <axis>       remove one axis from polling");
    println!("  state                print the cached axis states");
    println!("  quit                 exit");
}

fn parse_axis_list(s: &str) -> Vec<u32> {
    s.split(',')
        .filter_map(|tok| tok.trim().parse::<u32>().ok())
        .filter(|a| *a > 0)
        .collect()
}

fn print_state(manager: &Arc<AriesManager>) {
    let snapshot = manager.snapshot_state();
    if snapshot.is_empty() {
        println!("no axis state cached yet");
        return;
    }
    let mut axes: Vec<u32> = snapshot.keys().copied().collect();
    axes.sort_unstable();
    for axis in axes {
        let state = &snapshot[&axis];
        let position = state
            .position
            .map_or_else(|| "?".to_string(), |p| p.to_string());
        let running = match state.running {
            Some(true) => "run",
            Some(false) => "stopped",
            None => "?",
        };
        println!(
            "[{}] A{axis}: pos={position} ({running}) updated {} ms ago raw={:?}",
            now_stamp(),
            state.updated_at.elapsed().as_millis(),
            state.raw_last
        );
    }
}

async fn handle_move(manager: &Arc<AriesManager>, relative: bool, args: &[&str]) {
    let (Some(axis), Some(value)) = (
        args.first().and_then(|a| a.parse::<u32>().ok()),
        args.get(1).and_then(|v| v.parse::<i64>().ok()),
    ) else {
        println!("usage: move {} <axis> <integer>", if relative { "rel" } else { "abs" });
        return;
    };

    let callback = move |result: AriesResult<Reply>| match result {
        Ok(reply) => println!(
            "[{}] A{axis}: move acknowledged ({:?})",
            now_stamp(),
            reply
        ),
        Err(e) => println!("[{}] A{axis}: move failed: {e}", now_stamp()),
    };

    let sent = if relative {
        manager.move_relative_async(axis, value, 0, 0, callback)
    } else {
        manager.move_absolute_async(axis, value, 0, 0, callback)
    };
    match sent {
        Ok(()) => println!("command sent (axis={axis})"),
        Err(e) => println!("failed to send command: {e}"),
    }
}

async fn handle_command(manager: &Arc<AriesManager>, line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => {}
        ["help"] => print_help(),
        ["quit"] | ["exit"] => return false,
        ["connect"] => match manager.connect_once().await {
            Ok(()) => println!("connected"),
            Err(e) => println!("connect failed: {e}"),
        },
        ["start"] => match manager.start().await {
            Ok(()) => println!("manager started"),
            Err(e) => println!("start failed: {e}"),
        },
        ["move", "abs", rest @ ..] => handle_move(manager, false, rest).await,
        ["move", "rel", rest @ ..] => handle_move(manager, true, rest).await,
        ["poll", "set", list] => {
            let axes = parse_axis_list(list);
            if axes.is_empty() {
                println!("usage: poll set <a,b,c>");
            } else {
                manager.set_poll_axes(axes.clone());
                println!("polling axes {axes:?}");
            }
        }
        ["poll", "add", axis] => match axis.parse::<u32>() {
            Ok(axis) if axis > 0 => {
                manager.add_poll_axis(axis);
                println!("polling axis {axis}");
            }
            _ => println!("usage: poll add <axis>"),
        },
        ["poll", "rm", axis] => match axis.parse::<u32>() {
            Ok(axis) => {
                manager.remove_poll_axis(axis);
                println!("stopped polling axis {axis}");
            }
            _ => println!("usage: poll rm <axis>"),
        },
        ["state"] => print_state(manager),
        _ => println!("unknown command, try 'help'"),
    }
    true
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            usage();
            return ExitCode::FAILURE;
        }
    };

    let manager = match AriesManager::new(config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    manager.register_connection_handler(Arc::new(|connected, detail: &str| {
        if connected {
            println!("[manager] connected: {detail}");
        } else {
            println!("[manager] disconnected: {detail}");
        }
    }));

    // Unsolicited device errors and warnings surface on the console with
    // decoded text where the code is known.
    manager.register_spontaneous_handler(Arc::new(|reply: &Reply| {
        let decoded = reply
            .params
            .first()
            .and_then(|code| error_text(code))
            .unwrap_or("unrecognized notification");
        println!(
            "[device] {} {}{}: {decoded} ({:?})",
            reply.kind.as_char(),
            reply.cmd,
            reply.axis,
            reply.raw
        );
    }));

    println!("ARIES/LYNX CLI - enter 'help' for commands");
    info!("driver configured, awaiting commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\ninterrupted, stopping");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(&manager, &line).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("stdin error: {e}");
                        break;
                    }
                }
            }
        }
    }

    manager.stop().await;
    println!("exited");
    ExitCode::SUCCESS
}
