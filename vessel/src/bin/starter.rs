//! The single launcher binary.
//!
//! One invocation, four roles: this process runs STAGE1 in place, enters
//! the requested namespaces, then forks the container process (STAGE2),
//! which in turn splits off the RPC server with shared filesystem state.
//! The remaining copy becomes MASTER. Role selection after each fork goes
//! through the stage selector in the shared-memory region.
//!
//! The command surface lives elsewhere; this binary takes a prepared launch
//! record as JSON (`--config` file or stdin) plus internal flags.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vessel::rpc::{RpcOps, RpcServer};
use vessel::stages::master::{self, MasterInput};
use vessel::stages::{stage1, stage2};
use vessel::starter::{
    self, FdTable, SharedRegion, StageKind, StageSockets, ensure_single_threaded,
};
use vessel_shared::EngineConfig;
use vessel_shared::constants::ENV_STAGE_SHM_FD;

const DEFAULT_SYSCONF: &str = "/etc/vessel/vessel.conf";

#[derive(Parser, Debug)]
#[command(name = "vessel-starter", about = "Container launch pipeline entry")]
struct Args {
    /// Launch record as JSON; "-" or absent reads stdin.
    #[arg(long)]
    config: Option<PathBuf>,

    /// System configuration file to snapshot into the launch record.
    #[arg(long, default_value = DEFAULT_SYSCONF)]
    sysconf: PathBuf,

    /// Internal: delete a directory inside a fresh fakeroot mapping.
    #[arg(long, hide = true)]
    fakeroot_cleanup: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Some(dir) = &args.fakeroot_cleanup {
        return match vessel::cleanup::fakeroot_cleanup_main(dir) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("vessel-starter: fakeroot cleanup: {e}");
                ExitCode::FAILURE
            }
        };
    }

    match launch(&args) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("vessel-starter: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn launch(args: &Args) -> Result<i32> {
    let mut config = read_launch_record(args)?;
    if config.sysconf == Default::default() && args.sysconf.exists() {
        config.sysconf = vessel_shared::SystemConfig::load(&args.sysconf)
            .context("loading system configuration")?;
    }

    // Stage selection must happen before this process grows threads.
    ensure_single_threaded().context("stage bootstrap")?;

    let mut shm = SharedRegion::create()?;
    // Re-exec'd copies (fakeroot cleanup helper) find the region by fd.
    // Forked copies inherit the mapping directly.
    // Safety: single-threaded here, nothing else reads the environment.
    unsafe { std::env::set_var(ENV_STAGE_SHM_FD, shm.raw_fd().to_string()) };

    let sockets = StageSockets::create()?;

    // ── STAGE1: validate and resolve in place ───────────────────────────
    shm.set_stage(StageKind::Stage1);
    let mut fdtable = FdTable::new();
    let config = stage1::run(config, &mut fdtable)?;
    let setuid_mode = stage1::setuid_mode(&config);
    fdtable.install()?;
    shm.write_config(&config.to_json().context("serializing launch record")?)?;

    // ── namespaces, then the stage forks ────────────────────────────────
    starter::enter_namespaces(&config, setuid_mode)?;

    shm.set_stage(StageKind::Stage2);
    let container_pid = match unsafe { nix::unistd::fork() }
        .map_err(|e| anyhow::anyhow!("fork stage2: {e}"))?
    {
        nix::unistd::ForkResult::Child => {
            let code = run_stage2_side(&shm, &config, sockets);
            std::process::exit(code);
        }
        nix::unistd::ForkResult::Parent { child } => child,
    };

    // ── MASTER ──────────────────────────────────────────────────────────
    shm.set_stage(StageKind::Master);
    let StageSockets {
        rpc: (rpc_client, rpc_server),
        stage2: (stage2_master, stage2_child),
        fdpass: (fdpass_client, fdpass_server),
    } = sockets;
    drop(rpc_server);
    drop(stage2_child);
    drop(fdpass_server);

    // STAGE2 confirms once the RPC server is forked and serving.
    wait_ready(&stage2_master)?;

    let rpc = RpcOps::new(rpc_client, fdpass_client);
    let code = master::run(MasterInput {
        config,
        rpc,
        stage2: stage2_master,
        container_pid,
        setuid_mode,
    })?;
    Ok(code)
}

/// Body of the forked container-side copy: dispatch by selector, split off
/// the RPC server with shared fs state, then become the container.
fn run_stage2_side(shm: &SharedRegion, config: &EngineConfig, sockets: StageSockets) -> i32 {
    if !matches!(shm.stage(), Ok(StageKind::Stage2)) {
        eprintln!("vessel-starter: stage selector mismatch in stage2 copy");
        return 1;
    }

    let StageSockets {
        rpc: (rpc_client, rpc_server),
        stage2: (stage2_master, stage2_child),
        fdpass: (fdpass_client, fdpass_server),
    } = sockets;
    drop(rpc_client);
    drop(fdpass_client);

    // The RPC server shares root/cwd/umask with this process: its pivot is
    // our pivot.
    match starter::fork_shared_fs() {
        Ok(None) => {
            // RPC_SERVER copy. The serve loop runs pinned to one dedicated
            // OS thread: every handler performs per-thread credential and
            // capability transitions, and they must all land on the same
            // thread for the drop-guards to undo what escalate did.
            drop(stage2_master);
            drop(stage2_child);
            let mainthread = vessel::mainthread::MainThread::spawn();
            let result = mainthread.run(move || {
                let mut server = RpcServer::new(rpc_server, fdpass_server);
                server.serve()
            });
            return match result {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("vessel-starter: rpc server: {e}");
                    1
                }
            };
        }
        Ok(Some(_rpc_pid)) => {}
        Err(e) => {
            eprintln!("vessel-starter: {e}");
            return 1;
        }
    }
    drop(rpc_server);
    drop(fdpass_server);
    drop(stage2_master);

    if let Err(e) = signal_ready(&stage2_child) {
        eprintln!("vessel-starter: stage2 ready: {e}");
        return 1;
    }

    match stage2::run(config, stage2_child) {
        Ok(never) => match never {},
        Err(e) => {
            eprintln!("vessel-starter: stage2: {e}");
            255
        }
    }
}

fn read_launch_record(args: &Args) -> Result<EngineConfig> {
    let text = match &args.config {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading launch record from stdin")?;
            buf
        }
    };
    if text.trim().is_empty() {
        bail!("empty launch record");
    }
    serde_json::from_str(&text).context("parsing launch record")
}

fn signal_ready(socket: &std::os::unix::net::UnixStream) -> std::io::Result<()> {
    use std::io::Write;
    let mut socket = socket;
    socket.write_all(&[0])
}

fn wait_ready(socket: &std::os::unix::net::UnixStream) -> Result<()> {
    let mut byte = [0u8; 1];
    let mut socket = socket;
    socket
        .read_exact(&mut byte)
        .context("waiting for stage2 readiness")?;
    Ok(())
}
