//! wardend: the in-guest control plane daemon.
//!
//! Command modes, dispatched on the first argument:
//! - (none) / `machine-manager`: run the full manager
//! - `fork-start`: exec trampoline used by the LXC fork integration
//! - `lxc-hook <hook> <machine-id>`: called by LXC; post-stop reports into
//!   the internal RPC surface

use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use warden::config::{GuestConfig, INTERNAL_RPC_PORT};
use warden_shared::wire::{Request, Response};

#[derive(Parser, Debug)]
struct MgrArgs {
    /// Override the data volume root (testing only).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("fork-start") => fork_start(&args[2..]),
        Some("lxc-hook") => lxc_hook(&args[2..]),
        Some("machine-manager") => run_manager(MgrArgs::parse_from(&args[1..])),
        _ => run_manager(MgrArgs::parse_from(&args)),
    }
}

fn run_manager(args: MgrArgs) -> Result<()> {
    let mut cfg = GuestConfig::detect().context("not a warden guest")?;
    if let Some(data_dir) = args.data_dir {
        cfg.data_dir = data_dir;
    }

    let _log_guard = warden::init_logging(&cfg)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build runtime")?;

    runtime.block_on(async {
        let manager = warden::Manager::start(cfg).await?;

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }

        manager.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

/// Exec trampoline: replace this process with the given argv. LXC uses it to
/// re-enter container setup from a clean image of this binary.
fn fork_start(args: &[String]) -> Result<()> {
    let Some((program, rest)) = args.split_first() else {
        bail!("fork-start: missing argv");
    };
    let err = std::process::Command::new(program).args(rest).exec();
    Err(err).with_context(|| format!("fork-start exec {}", program))
}

/// LXC hook entry. Only post-stop is implemented; the hook reports the stop
/// over the internal RPC port and exits non-zero only on transport failure.
fn lxc_hook(args: &[String]) -> Result<()> {
    let (Some(hook), Some(machine_id)) = (args.first(), args.get(1)) else {
        bail!("lxc-hook: expected <hook> <machine-id>");
    };
    if hook != "post-stop" {
        return Ok(());
    }

    let stream = std::net::TcpStream::connect(("127.0.0.1", INTERNAL_RPC_PORT))
        .context("connect internal rpc")?;
    let mut writer = stream.try_clone().context("clone stream")?;

    let mut line = serde_json::to_string(&Request {
        id: 1,
        method: "report_stopped".to_string(),
        params: serde_json::json!({ "machine_id": machine_id }),
    })?;
    line.push('\n');
    writer.write_all(line.as_bytes()).context("send report")?;
    writer.flush().context("flush report")?;

    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .context("read reply")?;
    // a manager-side error is not the hook's problem; log and exit 0
    if let Ok(response) = serde_json::from_str::<Response>(&reply) {
        if let Some(error) = response.error {
            eprintln!("post-stop report refused: {}", error);
        }
    }
    Ok(())
}
