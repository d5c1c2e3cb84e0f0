//! cookied - the cookieguard daemon
//!
//! Owns the shared cookie state and runs both roles from the protocol
//! spec: the Cookie Daemon (control-channel listener) and, for
//! demonstration purposes, a simulated traffic generator exercising the
//! Shim send/receive paths against the same shared state. The real
//! kernel datapath hook that would drive the Shim from live traffic is
//! out of scope (spec §1) — `--demo` stands in for it.

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cookieguard::config::CookieGuardConfig;
use cookieguard::daemon::{CookieDaemon, DaemonAction, SetCookieOutcome};
use cookieguard::error::CookieGuardError;
use cookieguard::shared::SharedRegion;
use cookieguard::shim;
use cookieguard::transport::{self, ControlChannel, LoopbackHub};
use cookieguard::wire::{self, ControlMessage};

/// cookieguard - cookie mechanism mitigating source-address spoofing amplification
#[derive(Parser, Debug)]
#[command(name = "cookied")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Create a fresh shared region instead of attaching to an existing one
    #[arg(long)]
    fresh: bool,

    /// Run a simulated send/receive traffic demo against the shared state
    /// instead of binding a real control socket (no raw-socket privilege
    /// required)
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

async fn run(args: Args) -> Result<(), CookieGuardError> {
    let config = match &args.config {
        Some(path) => CookieGuardConfig::from_file(path)?,
        None => {
            info!("no --config given, using built-in defaults");
            CookieGuardConfig::default()
        }
    };

    let now = now_secs();
    let path = std::path::Path::new(&config.shared_region_path);
    let region = if args.fresh || !path.exists() {
        info!(path = %config.shared_region_path, "creating shared state region");
        SharedRegion::create(path, config.cache_capacity, config.rotation_period_secs, now)
            .map_err(CookieGuardError::Shared)?
    } else {
        info!(path = %config.shared_region_path, "attaching to existing shared state region");
        SharedRegion::attach(path).map_err(CookieGuardError::Shared)?
    };

    let daemon = Arc::new(CookieDaemon::new(region.state.clone()));

    let rotation_task = {
        let daemon = daemon.clone();
        let period = config.rotation_period_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                if daemon.maybe_rotate_secrets(now_secs()) {
                    info!("rotated cookie secrets");
                }
            }
        })
    };

    if args.demo {
        run_demo(daemon.clone(), &config).await?;
    } else {
        let channel = transport::RawIcmpV6Channel::bind(config.local_address).map_err(CookieGuardError::Transport)?;
        info!(local = %config.local_address, "listening for ICMPv6 control messages");
        tokio::select! {
            result = run_control_loop(daemon.clone(), &channel, config.local_address) => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
            }
        }
    }

    rotation_task.abort();
    Ok(())
}

/// Drives the Cookie Daemon from a real control channel (spec §4.2,
/// §7): receive a datagram, validate it, dispatch it, and send back
/// whatever reply the daemon produces. Runs until the channel errors or
/// the caller's `select!` cancels it.
///
/// Every rejection here — wrong length, bad checksum, or a decode
/// failure — increments [`CookieDaemon::record_malformed_inbound`]
/// before the packet is dropped, per spec §7's "Malformed inbound ...
/// dropped, counter incremented."
async fn run_control_loop(
    daemon: Arc<CookieDaemon>,
    channel: &impl ControlChannel,
    local: Ipv6Addr,
) -> Result<(), CookieGuardError> {
    loop {
        let received = channel.recv().await.map_err(CookieGuardError::Transport)?;

        if received.bytes.len() != wire::MESSAGE_SIZE {
            daemon.record_malformed_inbound();
            warn!(src = %received.src, len = received.bytes.len(), "dropping malformed control packet: wrong length");
            continue;
        }
        let mut buf = [0u8; wire::MESSAGE_SIZE];
        buf.copy_from_slice(&received.bytes);

        if !wire::verify_checksum(&buf, received.src, local) {
            daemon.record_malformed_inbound();
            warn!(src = %received.src, "dropping malformed control packet: checksum mismatch");
            continue;
        }

        let msg = match ControlMessage::from_bytes(&received.bytes, true) {
            Ok(msg) => msg,
            Err(e) => {
                daemon.record_malformed_inbound();
                warn!(src = %received.src, error = %e, "dropping malformed control packet");
                continue;
            }
        };

        let now = now_secs() as u32;
        match daemon.handle(received.src, &msg, now) {
            DaemonAction::SetCookie(SetCookieOutcome::UnknownPeer(reply)) => {
                let bytes = wire::with_checksum(reply.to_bytes(), local, received.src);
                if let Err(e) = channel.send_to(received.src, &bytes).await {
                    warn!(dst = %received.src, error = %e, "failed to send SETCOOKIE-NOT-EXPECTED reply");
                }
            }
            DaemonAction::SetCookie(SetCookieOutcome::Applied) => {
                info!(src = %received.src, "SET-COOKIE applied")
            }
            DaemonAction::SetCookie(SetCookieOutcome::EchoMismatch) => {}
            DaemonAction::None => {}
        }
    }
}

/// Drives a tiny two-host simulation over an in-memory [`LoopbackHub`],
/// standing in for the kernel datapath hook that would otherwise feed the
/// Shim with real traffic (spec §1). Exercises: a cold send creating a
/// fresh entry, a peer answering our uncookied packet with SET-COOKIE,
/// and the daemon processing that SET-COOKIE as an unknown peer.
async fn run_demo(daemon: Arc<CookieDaemon>, config: &CookieGuardConfig) -> Result<(), CookieGuardError> {
    let host_addr: Ipv6Addr = "2001:db8::1".parse().expect("valid literal");
    let peer_addr: Ipv6Addr = "2001:db8::2".parse().expect("valid literal");

    let (hub, tap_rx) = LoopbackHub::new();
    let (host_chan, host_tx) = hub.channel(host_addr);
    let (peer_chan, peer_tx) = hub.channel(peer_addr);
    tokio::spawn(transport::route_loopback_hub(
        tap_rx,
        vec![(host_addr, host_tx), (peer_addr, peer_tx)],
    ));

    let t: u32 = 0;

    // Cold send from our host to `peer_addr`: allocates the entry and, per
    // spec §4.4, sends with no cookie attached until SET-COOKIE arrives.
    let outcome = shim::send(&daemon.state.cache, peer_addr, t, config.cookies_active_default, &config.timers);
    info!(?outcome, "cold send to peer");

    // The peer sends us a SET-COOKIE teaching a cookie it wants us to use.
    // We have no entry for it yet, so the daemon must answer
    // SETCOOKIE-NOT-EXPECTED rather than install anything (spec §4.2).
    let requested = [0xAB; 12];
    let set_cookie = ControlMessage::set_cookie([0; 12], requested, config.refresh_exponent);
    peer_chan
        .send_to(host_addr, &set_cookie.to_bytes())
        .await
        .map_err(CookieGuardError::Transport)?;

    let received = host_chan.recv().await.map_err(CookieGuardError::Transport)?;
    let msg = ControlMessage::from_bytes(&received.bytes, true).map_err(CookieGuardError::Wire)?;
    match daemon.handle(received.src, &msg, t) {
        DaemonAction::SetCookie(SetCookieOutcome::UnknownPeer(reply)) => {
            info!("unknown-peer SET-COOKIE, replying SETCOOKIE-NOT-EXPECTED");
            host_chan
                .send_to(received.src, &reply.to_bytes())
                .await
                .map_err(CookieGuardError::Transport)?;
        }
        DaemonAction::SetCookie(SetCookieOutcome::Applied) => info!("SET-COOKIE applied"),
        DaemonAction::SetCookie(SetCookieOutcome::EchoMismatch) => warn!("SET-COOKIE echo mismatch"),
        DaemonAction::None => {}
    }

    Ok(())
}
