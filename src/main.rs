//! BMS diagnostic host smoke runner.
//!
//! Exercises the full stack (channel, DoCAN transport, command objects,
//! TLE9012 factory) against the built-in bus simulator. Real deployments
//! plug a vendor driver into the `CanBus` trait instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use bms_diag::channel::CanChannel;
use bms_diag::config::DiagConfig;
use bms_diag::sim::{Responder, SimBus};
use bms_diag::tle9012::Tle9012;
use bms_diag::transport::UdsTransport;
use bms_diag::uds::{
    shared, Iocbi, IocbiRecord, RoutineAction, RoutineControl, RoutineRecord, SharedCommand,
};

/// Simulated BMS controller: EVADC group-3 reads return synthetic counts,
/// cell measurements return a plausible voltage, everything else is echoed
/// positively.
fn bms_responder() -> Responder {
    let mut echo = SimBus::echo_responder();
    Box::new(move |request| {
        if request.len() >= 4 && request[0] == 0x2F && request[1] == 0xE1 {
            let channel = request[2];
            let counts = 0x0800u16 + (channel as u16) * 0x10;
            return Some(vec![
                0x6F,
                0xE1,
                channel,
                request[3],
                (counts >> 8) as u8,
                (counts & 0xFF) as u8,
            ]);
        }
        if request.len() >= 6 && request[0] == 0x2F && request[1] == 0x00 && request[2] == 0x42 {
            // GetCellMeasure: [dev, cell] in, [dev, cell, counts] out
            let mut resp = request.to_vec();
            resp[0] = 0x6F;
            resp.extend_from_slice(&[0x0B, 0xEB]);
            return Some(resp);
        }
        echo(request)
    })
}

fn evadc_command(channel: u8) -> Iocbi {
    Iocbi::new(IocbiRecord::new(0xE1, channel))
        .with_timeout(Duration::from_millis(100))
        .with_callback(Box::new(move |cmd| {
            let record = &cmd.record().status_record;
            if record.len() < 2 {
                info!("EVADC G3CH{}: no data", channel);
            } else {
                let counts = ((record[0] as u16) << 8) | record[1] as u16;
                info!("EVADC G3CH{}: {} counts", channel, counts);
            }
            Ok(())
        }))
}

fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    println!("╔═══════════════════════════════════════════════════════╗");
    println!("║     BMS Diagnostic Host v1.0 - UDS over DoCAN         ║");
    println!("║     Simulator smoke run                               ║");
    println!("╚═══════════════════════════════════════════════════════╝");
    println!();

    let cfg = match std::env::args().nth(1) {
        Some(path) => DiagConfig::from_file(path)?,
        None => DiagConfig::default(),
    };
    info!(
        "session SA:0x{:02X} TA:0x{:02X} {} kbit/s fd:{}",
        cfg.source_address, cfg.target_address, cfg.bitrate_kbps, cfg.fd
    );

    let bus = Arc::new(SimBus::new(&cfg, bms_responder()));
    let channel = Arc::new(CanChannel::new(bus)?);
    channel.start()?;

    let transport = UdsTransport::new(&cfg, Arc::clone(&channel));

    // EVADC group-3 channels through the command dictionary
    for ch in 0..4u8 {
        transport.add_command(format!("GET_EVADC_G3CH{}", ch), shared(evadc_command(ch)))?;
    }
    for key in transport.command_keys() {
        if !transport.execute_key(&key)? {
            info!("{} failed", key);
        }
    }

    // Segmented-tx exercise: an 80-byte routine status record
    let rc_option: Vec<u8> = (0..80).collect();
    let rc = shared(
        RoutineControl::new(
            RoutineRecord::new(RoutineAction::Start, 0x02, 0x00).with_status(rc_option),
        )
        .with_timeout(Duration::from_millis(100)),
    );
    if transport.execute(&rc)? {
        info!("routine control round trip complete");
    }

    // TLE9012 factory commands against device 0
    let mut csc0 = Tle9012::new(0)?;
    let timeout = Duration::from_millis(100);
    let enable: SharedCommand = csc0.set_cell_enable(0, 1, timeout)?;
    let threshold: SharedCommand = csc0.set_ovolt_flt_thd(0x2A0, timeout)?;
    let measure: SharedCommand = csc0.get_cell_measure(3, timeout)?;
    for cmd in [&enable, &threshold, &measure] {
        transport.execute(cmd)?;
    }

    transport.dispose();
    channel.join();
    info!("smoke run complete");
    Ok(())
}
