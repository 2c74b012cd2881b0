use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lora_pkt_fwd::fwd::config::{self, Config, JSON_CONF_DEFAULT};
use lora_pkt_fwd::fwd::{
    downstream, gpsloop, jit, spectral, stats, upstream, valid, wait_ms, Gateway,
};
use lora_pkt_fwd::hal::gps::Gps;
use lora_pkt_fwd::hal::{lgw_open, LgwHal};

#[derive(Parser, Debug)]
#[command(name = "lora-pkt-fwd")]
#[command(about = "LoRa concentrator packet forwarder (Semtech UDP protocol)")]
struct Cli {
    /// Configuration file to use instead of 'global_conf.json'
    #[arg(short = 'c', long = "conf")]
    conf_file: Option<String>,
}

fn open_socket(serv_addr: &str, serv_port: u16, label: &str) -> Result<UdpSocket> {
    let sock = UdpSocket::bind(("0.0.0.0", 0))
        .with_context(|| format!("[{}] failed to open socket", label))?;
    sock.connect((serv_addr, serv_port)).with_context(|| {
        format!("[{}] failed to connect socket to server {} (port {})", label, serv_addr, serv_port)
    })?;
    Ok(sock)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let conf_fname = cli.conf_file.as_deref().unwrap_or(JSON_CONF_DEFAULT);

    info!("*** Packet Forwarder ***");

    match run(conf_fname) {
        Ok(()) => {
            info!("INFO: Exiting packet forwarder program");
        }
        Err(e) => {
            error!("ERROR: [main] {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(conf_fname: &str) -> Result<()> {
    /* load configuration files */
    let cfg: Config = config::load(conf_fname)?;

    /* Start GPS a.s.a.p., to allow it to lock */
    let gps = match cfg.gw.gps_tty_path {
        Some(ref tty_path) => match Gps::enable(tty_path) {
            Ok(gps) => {
                info!("INFO: [main] TTY port {} open for GPS synchronization", tty_path);
                Some(gps)
            }
            Err(e) => {
                warn!(
                    "WARNING: [main] impossible to open {} for GPS sync ({}, check permissions)",
                    tty_path, e
                );
                None
            }
        },
        None => None,
    };

    /* sockets to the network server */
    let sock_up = open_socket(&cfg.gw.serv_addr, cfg.gw.serv_port_up, "up")?;
    let sock_down = open_socket(&cfg.gw.serv_addr, cfg.gw.serv_port_down, "down")?;

    /* starting the concentrator */
    let mut concentrator: Box<dyn LgwHal> = lgw_open(cfg.lgw.clone())?;
    concentrator
        .lgw_start()
        .context("failed to start the concentrator")?;
    info!("INFO: [main] concentrator started, packet can now be received");

    /* get the concentrator EUI */
    match concentrator.lgw_get_eui() {
        Ok(eui) => info!("INFO: concentrator EUI: 0x{:016X}", eui),
        Err(_) => error!("ERROR: failed to get concentrator EUI"),
    }

    let spectral_scan_enabled = cfg.spectral_scan.enable;
    let gps_enabled = gps.is_some();
    let stat_interval = cfg.gw.stat_interval;

    let gw = Arc::new(Gateway::new(cfg, concentrator, gps, sock_up, sock_down));

    /* configure signal handling: first signal drains, a second one drops */
    {
        let gw = gw.clone();
        ctrlc::set_handler(move || {
            if gw.exit_sig.swap(true, Ordering::Relaxed) {
                gw.quit_sig.store(true, Ordering::Relaxed);
            }
        })
        .context("failed to install signal handler")?;
    }

    /* spawn threads to manage upstream and downstream */
    let mut handles = Vec::new();
    {
        let gw = gw.clone();
        handles.push(thread::Builder::new().name("up".into()).spawn(move || upstream::thread_up(&gw))?);
    }
    {
        let gw = gw.clone();
        handles.push(
            thread::Builder::new().name("down".into()).spawn(move || downstream::thread_down(&gw))?,
        );
    }
    {
        let gw = gw.clone();
        handles.push(thread::Builder::new().name("jit".into()).spawn(move || jit::thread_jit(&gw))?);
    }

    /* spawn thread for background spectral scan */
    if spectral_scan_enabled {
        let gw = gw.clone();
        handles.push(
            thread::Builder::new()
                .name("spectral".into())
                .spawn(move || spectral::thread_spectral_scan(&gw))?,
        );
    }

    /* spawn threads to manage GPS */
    if gps_enabled {
        let gw_gps = gw.clone();
        handles.push(
            thread::Builder::new().name("gps".into()).spawn(move || gpsloop::thread_gps(&gw_gps))?,
        );
        let gw_valid = gw.clone();
        handles.push(
            thread::Builder::new().name("valid".into()).spawn(move || valid::thread_valid(&gw_valid))?,
        );
    }

    /* main loop task : statistics collection */
    while gw.running() {
        /* wait for next reporting interval, polling the exit flags every second */
        for _ in 0..stat_interval.max(1) {
            if !gw.running() {
                break;
            }
            wait_ms(1000);
        }
        if gw.running() {
            stats::report_stats(&gw);
        }
    }

    /* wait for all threads to finish (1 fetch cycle max) */
    for handle in handles {
        if handle.join().is_err() {
            error!("ERROR: failed to join a forwarder thread");
        }
    }

    /* if an exit signal was received, try to quit properly */
    if gw.exit_sig.load(Ordering::Relaxed) && !gw.quit_sig.load(Ordering::Relaxed) {
        /* stop the hardware */
        match gw.concentrator.lock().unwrap().lgw_stop() {
            Ok(()) => info!("INFO: concentrator stopped successfully"),
            Err(_) => warn!("WARNING: failed to stop concentrator successfully"),
        }
        if let Some(ref gps) = gw.gps {
            gps.lock().unwrap().disable();
            info!("INFO: GPS closed successfully");
        }
    }

    Ok(())
}
