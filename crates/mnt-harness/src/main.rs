#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use mnt_harness::{
    e2e::{
        BootScenarioConfig, FallbackScenarioConfig, RecoveryScenarioConfig, run_boot_scenario,
        run_fallback_scenario, run_recovery_scenario,
    },
    extract_ancast_probe, extract_region, validate_ancast_fixture, validate_boot_info_fixture,
    validate_mbr_fixture, validate_superblock_fixture,
};
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("check-fixtures") => check_fixtures(),
        Some("generate-fixture") => generate_fixture(&args[1..]),
        Some("run-boot") => run_boot(&args[1..]),
        Some("run-fallback") => run_fallback(&args[1..]),
        Some("run-recovery") => run_recovery(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn check_fixtures() -> Result<()> {
    let dir = Path::new("conformance/fixtures");

    let ancast = validate_ancast_fixture(&dir.join("ancast_header_sparse.json"))?;
    let superblock = validate_superblock_fixture(&dir.join("superblock_header_sparse.json"))?;
    let mbr = validate_mbr_fixture(&dir.join("mbr_rednand_sparse.json"))?;
    let boot_info = validate_boot_info_fixture(&dir.join("boot_info_coldboot.json"))?;

    println!(
        "ancast: sig_type={:#x} target={:#x} version={:#x}",
        ancast.sig_type,
        ancast.target(),
        ancast.version
    );
    println!(
        "superblock: version={} generation={:#x}",
        superblock.version, superblock.generation.0
    );
    println!(
        "mbr: boot_signature={} partitions={}",
        mbr.has_boot_signature(),
        mbr.partitions.iter().filter(|p| !p.is_empty()).count()
    );
    println!(
        "boot_info: coldboot={} boot_count={}",
        boot_info.is_coldboot, boot_info.boot_count
    );
    Ok(())
}

fn generate_fixture(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("usage: mnt-harness generate-fixture <image> [ancast-probe|region <offset> <len>]");
    }

    let image_path = Path::new(&args[0]);
    let image_data =
        fs::read(image_path).with_context(|| format!("failed to read {}", image_path.display()))?;

    let kind = args.get(1).map_or("ancast-probe", String::as_str);

    let fixture = match kind {
        "ancast-probe" => extract_ancast_probe(&image_data)?,
        "region" => {
            let offset: usize = args
                .get(2)
                .context("region requires <offset>")?
                .parse()
                .context("invalid offset")?;
            let len: usize = args
                .get(3)
                .context("region requires <len>")?
                .parse()
                .context("invalid len")?;
            extract_region(&image_data, offset, len)?
        }
        _ => bail!("unknown fixture kind: {kind}"),
    };

    println!("{}", serde_json::to_string_pretty(&fixture)?);
    Ok(())
}

fn run_boot(args: &[String]) -> Result<()> {
    let mut config = BootScenarioConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--fused" => {
                config.fused = true;
                index += 1;
            }
            "--body-len" => {
                let raw = args.get(index + 1).context("--body-len requires a value")?;
                config.body_len = raw.parse().context("invalid --body-len value")?;
                index += 2;
            }
            "--generation" => {
                let raw = args
                    .get(index + 1)
                    .context("--generation requires a value")?;
                config.generation = raw.parse().context("invalid --generation value")?;
                index += 2;
            }
            other => {
                bail!("unknown run-boot option: {other}");
            }
        }
    }

    let report = run_boot_scenario(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_fallback(args: &[String]) -> Result<()> {
    let mut config = FallbackScenarioConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--generations" => {
                let raw = args
                    .get(index + 1)
                    .context("--generations requires a value")?;
                let parsed: Vec<u32> = raw
                    .split(',')
                    .map(|part| part.trim().parse())
                    .collect::<Result<_, _>>()
                    .context("invalid --generations value")?;
                let Ok(four) = <[u32; 4]>::try_from(parsed) else {
                    bail!("--generations needs exactly four comma-separated values");
                };
                config.generations = four;
                index += 2;
            }
            "--no-damage" => {
                config.damage_newest = false;
                index += 1;
            }
            other => {
                bail!("unknown run-fallback option: {other}");
            }
        }
    }

    let report = run_fallback_scenario(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_recovery(args: &[String]) -> Result<()> {
    let mut config = RecoveryScenarioConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--worn-position" => {
                let raw = args
                    .get(index + 1)
                    .context("--worn-position requires a value")?;
                config.worn_position = raw.parse().context("invalid --worn-position value")?;
                index += 2;
            }
            other => {
                bail!("unknown run-recovery option: {other}");
            }
        }
    }

    let report = run_recovery_scenario(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_usage() {
    println!("mnt-harness — fixture management and boot scenario runs");
    println!();
    println!("USAGE:");
    println!("  mnt-harness check-fixtures");
    println!("  mnt-harness generate-fixture <image> [ancast-probe|region <offset> <len>]");
    println!("  mnt-harness run-boot [--fused] [--body-len N] [--generation N]");
    println!("  mnt-harness run-fallback [--generations A,B,C,D] [--no-damage]");
    println!("  mnt-harness run-recovery [--worn-position N]");
    println!();
    println!("FIXTURE GENERATION:");
    println!("  Extracts sparse JSON fixtures from real dump files.");
    println!("  In 'ancast-probe' mode (default), captures the loader probe window of a");
    println!("  signed image after checking that its header parses. Use 'region' mode to");
    println!("  capture arbitrary byte ranges: superblock headers, partition tables, or");
    println!("  any other on-media structure.");
    println!();
    println!("SCENARIOS:");
    println!("  run-boot      mounts deterministic media, stages the firmware out of the");
    println!("                filesystem, seeds the persistent window and hands it off.");
    println!("  run-fallback  commits one superblock per slot, wears the newest out, and");
    println!("                mounts again to show the generation fallback.");
    println!("  run-recovery  installs a four-copy recovery ring, wears one copy, and runs");
    println!("                the per-boot refresh pass over it.");
    println!("  Each scenario prints a JSON report.");
    println!();
    println!("EXAMPLES:");
    println!("  mnt-harness generate-fixture fw.img > conformance/fixtures/fw_probe.json");
    println!("  mnt-harness generate-fixture slc.raw region 0 512 > conformance/fixtures/raw.json");
    println!("  mnt-harness run-fallback --generations 10,12,11,9");
    println!("  mnt-harness run-recovery --worn-position 2");
}
