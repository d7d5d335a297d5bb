// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use bytes::Bytes;
use clap::Parser;
use env_logger;
use log::{error, info};

use ipchain::setfile::{IpSetfile, SetfileBuilder, SetfileVersion, parse_header};

/// Utility program for inspecting a calibration (setfile) blob: prints the
/// header and, for each sub-IP, where each scenario's table lives.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Setfile to inspect.
    #[arg(required_unless_present = "demo")]
    path: Option<String>,

    /// Inspect a generated v3 blob with two sub-IPs instead of reading a file.
    #[arg(long, default_value_t = false)]
    demo: bool,
}

fn demo_blob() -> Bytes {
    SetfileBuilder::new(SetfileVersion::V3, 3)
        .designed_bits(0b1000)
        .codes("A0", "r1")
        .sub_ip(vec![0, 1, 1], vec![vec![0x11; 32], vec![0x22; 48]])
        .sub_ip(vec![0, 0, 0], vec![vec![0x33; 16]])
        .build()
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let blob = match &args.path {
        Some(path) if !args.demo => match std::fs::read(path) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                error!("could not read {}: {}", path, e);
                std::process::exit(1);
            }
        },
        _ => demo_blob(),
    };
    let header = match parse_header(&blob) {
        Ok(header) => header,
        Err(e) => {
            error!("not a valid setfile: {:?}", e);
            std::process::exit(1);
        }
    };
    info!("setfile v{}, {} bytes, {} sub-IPs, {} scenarios",
          header.version as u32, blob.len(), header.num_ips, header.num_scenarios);
    if header.designed_bits != 0 {
        info!("designed bits {:#x}, version code {:?}, revision code {:?}",
              header.designed_bits, header.version_code, header.revision_code);
    }

    for subip in 0..header.num_ips {
        let setfile = match IpSetfile::load(&blob, &header, subip) {
            Ok(setfile) => setfile,
            Err(e) => {
                error!("sub-IP {}: {:?}", subip, e);
                continue;
            }
        };
        info!("sub-IP {}: {} setfiles", subip, setfile.using_count);
        for scenario in 0..setfile.num_scenarios() {
            match setfile.resolve(scenario) {
                Ok(entry) => info!("  scenario {:2} -> {:#08x} ({} bytes)",
                                   scenario, entry.addr, entry.size),
                Err(e) => info!("  scenario {:2} -> {:?}", scenario, e),
            }
        }
    }
}
