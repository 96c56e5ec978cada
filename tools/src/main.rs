// Jackson Coxson
// gandalf - relays local TCP ports to mapped ports on USB attached devices

use std::{path::Path, process::exit, sync::Arc, time::Duration};

use clap::{Arg, Command};
use gandalf::{
    GandalfError,
    engine::Engine,
    exit_codes, lifecycle, status,
    usbmuxd::{DeviceEvent, UsbmuxdAddr},
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::error;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("unhandled panic: {info}");
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        exit(exit_codes::UNHANDLED);
    }));

    let matches = Command::new("gandalf")
        .version(env!("CARGO_PKG_VERSION"))
        .about(
            "Relay that binds local TCP ports to be forwarded to mapped ports on USB attached devices",
        )
        .arg(
            Arg::new("mappings")
                .short('m')
                .long("mappings")
                .value_name("FILE")
                .help("Tunnel mapping file; without it only plug events are printed"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("tunnel-timeout")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("Close a tunnel after this many seconds without traffic"),
        )
        .arg(
            Arg::new("status_port")
                .short('p')
                .long("status-port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .default_value("5000")
                .help("Port for the read-only status endpoint"),
        )
        .arg(
            Arg::new("reload")
                .short('r')
                .long("reload")
                .action(clap::ArgAction::SetTrue)
                .help("Ask the running daemon to reload its mappings, then exit"),
        )
        .arg(
            Arg::new("shutdown")
                .long("shutdown")
                .action(clap::ArgAction::SetTrue)
                .help("Ask the running daemon to shut down, then exit"),
        )
        .arg(
            Arg::new("status")
                .long("status")
                .action(clap::ArgAction::SetTrue)
                .help("Print the status JSON of the running daemon, then exit"),
        )
        .get_matches();

    let status_port = *matches
        .get_one::<u16>("status_port")
        .expect("status_port has a default");

    // One-shots driving an already-running daemon come first.
    if matches.get_flag("reload") {
        match lifecycle::reload_running_daemon(Path::new(lifecycle::PID_FILE)) {
            Ok(()) => exit(0),
            Err(e) => {
                eprintln!("reload failed: {e}");
                exit(e.exit_code());
            }
        }
    }
    if matches.get_flag("shutdown") {
        match lifecycle::shutdown_running_daemon(Path::new(lifecycle::PID_FILE)) {
            Ok(()) => exit(0),
            Err(e) => {
                eprintln!("shutdown failed: {e}");
                exit(e.exit_code());
            }
        }
    }
    if matches.get_flag("status") {
        let url = format!("http://127.0.0.1:{status_port}/");
        let body = ureq::get(&url)
            .call()
            .and_then(|mut res| Ok(res.body_mut().read_to_string()?));
        match body {
            Ok(body) => {
                println!("{body}");
                exit(0);
            }
            Err(e) => {
                eprintln!("status endpoint not reachable, is the daemon running? ({e})");
                exit(exit_codes::STATUS_UNREACHABLE);
            }
        }
    }

    let mux_addr = UsbmuxdAddr::from_env_var().unwrap_or_default();

    let Some(mappings) = matches.get_one::<String>("mappings") else {
        if let Err(e) = listen_only(mux_addr).await {
            eprintln!("{e}");
            exit(e.exit_code());
        }
        exit(0);
    };

    let pid_path = Path::new(lifecycle::PID_FILE);
    if let Ok(pid) = lifecycle::read_pid_file(pid_path)
        && pid.as_raw() != std::process::id() as i32
        && lifecycle::pid_is_alive(pid)
    {
        eprintln!("another instance is already running as pid {pid}");
        exit(exit_codes::ALREADY_RUNNING);
    }
    if let Err(e) = lifecycle::write_pid_file(pid_path) {
        eprintln!("{e}");
        exit(e.exit_code());
    }

    let tunnel_timeout = matches
        .get_one::<u64>("timeout")
        .map(|secs| Duration::from_secs(*secs));
    let engine = match Engine::new(mux_addr, mappings, tunnel_timeout) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{e}");
            exit(e.exit_code());
        }
    };

    let status_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = status::serve(status_engine, status_port).await {
            error!("status server stopped: {e}");
        }
    });

    // SIGUSR1 reloads the mapping in place.
    let reload_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(usr1) => usr1,
            Err(e) => {
                error!("can't install the reload handler: {e}");
                return;
            }
        };
        while usr1.recv().await.is_some() {
            Arc::clone(&reload_engine).restart().await;
        }
    });

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            eprintln!("can't install signal handlers: {e}");
            exit(exit_codes::UNKNOWN);
        }
    };
    let mut usr2 = match signal(SignalKind::user_defined2()) {
        Ok(usr2) => usr2,
        Err(e) => {
            eprintln!("can't install signal handlers: {e}");
            exit(exit_codes::UNKNOWN);
        }
    };

    tokio::select! {
        res = Arc::clone(&engine).run() => {
            if let Err(e) = res {
                error!("engine stopped: {e}");
                engine.complete_shutdown().await;
                exit(e.exit_code());
            }
        }
        _ = term.recv() => {}
        _ = usr2.recv() => {}
    }

    engine.complete_shutdown().await;
    exit(0);
}

/// Without a mapping file the tool just narrates plug events.
async fn listen_only(mux_addr: UsbmuxdAddr) -> Result<(), GandalfError> {
    let mut subscription = mux_addr.connect(1).await?;
    subscription.listen().await?;
    loop {
        match subscription.next_event().await? {
            DeviceEvent::Attached {
                device_id,
                properties,
            } => {
                println!(
                    "Device {} with serial number: {} connected",
                    device_id, properties.serial_number
                );
            }
            DeviceEvent::Detached { device_id } => {
                println!("Device {} disconnected", device_id);
            }
        }
    }
}
