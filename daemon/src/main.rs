//! Bus Daemon
//!
//! A local message bus endpoint server that:
//! - Listens on one or more Unix sockets (path or abstract namespace)
//! - Reads each client's kernel-verified uid/gid/pid before trusting it
//! - Authenticates clients with the EXTERNAL mechanism
//! - Shuts down cleanly on SIGINT/SIGTERM

use std::sync::Arc;

use bus_transport::{EndpointRegistry, Handoff, UnixTransport};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

mod config;
mod router;

use config::DaemonConfig;
use router::ExternalAuth;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let config = DaemonConfig::from_args(&args)?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter()),
    )
    .init();

    log::info!("Bus daemon starting...");
    for spec in &config.listen {
        log::info!("  Listen: {}", spec);
    }
    log::info!("  Credential timeout: {} ms", config.credential_timeout_ms);
    if !config.allow_uids.is_empty() {
        log::info!("  Allowed uids: {:?}", config.allow_uids);
    }

    // Register before any listener runs so an early SIGTERM is not lost.
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    let registry = Arc::new(EndpointRegistry::new());
    let auth: Arc<dyn Handoff> = Arc::new(ExternalAuth::new(
        Arc::clone(&registry),
        config.allow_uids.clone(),
    ));

    let mut transports = Vec::with_capacity(config.listen.len());
    for spec in &config.listen {
        let mut transport =
            UnixTransport::new(config.transport(), Arc::clone(&registry), Arc::clone(&auth));
        transport.start_listen(spec)?;
        transports.push(transport);
    }

    if let Some(signal) = signals.forever().next() {
        log::info!("Received signal {}, shutting down", signal);
    }

    for transport in &mut transports {
        if let Err(e) = transport.stop_listen() {
            log::warn!("Failed to stop {} transport: {}", transport.name(), e);
        }
        log::debug!("Transport stats:\n{}", transport.stats().render());
    }

    let stopped = registry.shutdown_all();
    log::info!("Bus daemon stopped ({} endpoints closed)", stopped);
    Ok(())
}

fn print_usage() {
    println!("Usage: bus-daemon [--listen SPEC]... [--cred-timeout-ms MS] [--config FILE]");
    println!();
    println!("  --listen SPEC          unix:path=<file> or unix:abstract=<name> (repeatable)");
    println!("  --cred-timeout-ms MS   credential exchange timeout per connection");
    println!("  --config FILE          JSON config file; flags override its values");
    println!();
    println!("Default listen spec: {}", config::DEFAULT_LISTEN);
}
