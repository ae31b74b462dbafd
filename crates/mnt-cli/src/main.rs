#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use mnt_ancast::{FileSource, load_image};
use mnt_crypto::Otp;
use mnt_isfs::{Filesystem, Volume, VolumeDevice, VolumeId, parse_volume_path};
use mnt_isfshax::{SlotCondition, status};
use mnt_nand::{FileNand, FileSectorDevice, RedNand, SectorDevice, discover_partitions};
use mnt_ondisk::{FstEntry, Mbr, PrshHeader, PrshRecord};
use mnt_prsh::{InitOutcome, PrshStore};
use mnt_types::{ANCAST_TARGET_IOP, ANCAST_TARGET_PPC, SECTOR_SIZE, SectorIndex};
use serde::Serialize;
use std::env;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    // Diagnostics go to stderr; stdout carries command output only, so
    // isfs-cat and --json stay pipeable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("ancast-inspect") => ancast_inspect(&args[1..]),
        Some("ancast-verify") => ancast_verify(&args[1..]),
        Some("ancast-extract") => ancast_extract(&args[1..]),
        Some("isfs-ls") => isfs_ls(&args[1..]),
        Some("isfs-cat") => isfs_cat(&args[1..]),
        Some("isfshax-status") => isfshax_status(&args[1..]),
        Some("prsh-dump") => prsh_dump(&args[1..]),
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

fn print_usage() {
    println!("minute-cli — inspect, verify, and extract tooling over console dump images");
    println!();
    println!("USAGE:");
    println!("  minute-cli ancast-inspect <image> [--json]");
    println!("  minute-cli ancast-verify <image>");
    println!("  minute-cli ancast-extract <image> <output> [--otp <otp.bin>]");
    println!("  minute-cli isfs-ls <image> <otp.bin> <volume:/path>");
    println!("  minute-cli isfs-cat <image> <otp.bin> <volume:/path> [--output <file>]");
    println!("  minute-cli isfshax-status <image> <otp.bin> [--json]");
    println!("  minute-cli prsh-dump <window.bin> <otp.bin> [--json]");
    println!();
    println!("IMAGES:");
    println!("  The slc and slccmpt volumes read raw NAND dumps (2112-byte page records,");
    println!("  data plus spare). The redslc and redslccmpt volumes read a whole SD card");
    println!("  image and locate their partition windows through its MBR.");
    println!();
    println!("EXAMPLES:");
    println!("  minute-cli ancast-inspect fw.img --json");
    println!("  minute-cli ancast-extract fw.img fw.body --otp otp.bin");
    println!("  minute-cli isfs-ls slc.raw otp.bin slc:/sys");
    println!("  minute-cli isfs-cat slc.raw otp.bin slc:/sys/version --output version.bin");
    println!("  minute-cli isfshax-status slc.raw otp.bin");
    println!("  RUST_LOG=mnt_isfs=debug minute-cli isfs-ls slc.raw otp.bin slc:/");
}

fn load_otp(path: &str) -> Result<Otp> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {path}"))?;
    Ok(Otp::from_bytes(&bytes)?)
}

/// Bind a volume to its image file: a raw NAND dump for the native banks,
/// an SD card image (with an MBR naming the partition windows) for the
/// redirected ones.
fn open_volume(image: &str, id: VolumeId) -> Result<Volume> {
    let device = if id.is_red() {
        let card = FileSectorDevice::open(image)
            .with_context(|| format!("failed to open SD image {image}"))?;
        let mut sector = vec![0_u8; SECTOR_SIZE];
        card.read_sectors(SectorIndex(0), &mut sector)?;
        let mbr = Mbr::parse(&sector)?;
        let partitions = discover_partitions(&mbr);
        let window = match id {
            VolumeId::RedSlc => partitions.slc,
            _ => partitions.slccmpt,
        };
        let rednand = RedNand::new(Arc::new(card), window)
            .with_context(|| format!("no usable {id} partition on {image}"))?;
        VolumeDevice::Red(rednand)
    } else {
        let nand = FileNand::open(image, id.bank())
            .with_context(|| format!("failed to open NAND dump {image}"))?;
        VolumeDevice::Nand(Arc::new(nand))
    };
    Ok(Volume::new(id, device))
}

fn ancast_inspect(args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        bail!("ancast-inspect requires an image path");
    };
    let json = args.iter().any(|arg| arg == "--json");

    let mut source =
        FileSource::open(path).with_context(|| format!("failed to open {path}"))?;
    let loaded = load_image(&mut source)?;
    let info = loaded.info();

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("target: {}", target_name(info.target));
        println!("device_id: {}", info.device_id);
        println!("sig_type: {:#x}", info.sig_type);
        println!("version: {:#06x}", info.version);
        println!("body_size: {:#x}", info.body_size);
        println!(
            "body: {}",
            if info.plaintext { "plaintext" } else { "ciphered" }
        );
        println!("load_base: {:#010x}", info.load_base);
        println!("body_addr: {:#010x}", info.body_addr);
    }
    Ok(())
}

fn target_name(target: u8) -> &'static str {
    match target {
        ANCAST_TARGET_IOP => "iop",
        ANCAST_TARGET_PPC => "ppc",
        _ => "unknown",
    }
}

fn ancast_verify(args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        bail!("ancast-verify requires an image path");
    };

    let mut source =
        FileSource::open(path).with_context(|| format!("failed to open {path}"))?;
    let loaded = load_image(&mut source)?;
    loaded.verify()?;

    println!("body_size: {:#x}", loaded.header().body_size);
    println!("body_sha1: {} (verified)", hex::encode(loaded.header().body_hash));
    Ok(())
}

fn ancast_extract(args: &[String]) -> Result<()> {
    let Some(image) = args.first() else {
        bail!("ancast-extract requires <image> <output>");
    };
    let Some(output) = args.get(1) else {
        bail!("ancast-extract requires <image> <output>");
    };
    let mut otp_path = None;
    let mut index = 2_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--otp" => {
                otp_path = Some(args.get(index + 1).context("--otp requires a value")?);
                index += 2;
            }
            other => {
                bail!("unknown ancast-extract option: {other}");
            }
        }
    }

    let mut source =
        FileSource::open(image).with_context(|| format!("failed to open {image}"))?;
    let mut loaded = load_image(&mut source)?;
    loaded.verify()?;

    if !loaded.header().body_is_plaintext() {
        let Some(otp_path) = otp_path else {
            bail!("image body is ciphered; extraction requires --otp <otp.bin>");
        };
        loaded.decrypt(&load_otp(otp_path)?)?;
    }

    fs::write(output, loaded.body()).with_context(|| format!("failed to write {output}"))?;
    println!("wrote {:#x} bytes to {output}", loaded.body().len());
    Ok(())
}

fn isfs_ls(args: &[String]) -> Result<()> {
    let [image, otp_path, path] = args else {
        bail!("isfs-ls requires <image> <otp.bin> <volume:/path>");
    };
    let otp = load_otp(otp_path)?;
    let (id, rest) = parse_volume_path(path)?;
    let isfs = Filesystem::mount(open_volume(image, id)?, &otp)?;

    let inner = rest.trim_matches('/');
    if inner.is_empty() {
        let mut dir = isfs.diropen_root()?;
        while let Some((_, entry)) = isfs.dirread(&mut dir)? {
            print_entry(&entry);
        }
        return Ok(());
    }

    let entry = isfs.stat(inner)?;
    if entry.is_directory() {
        let mut dir = isfs.diropen(inner)?;
        while let Some((_, entry)) = isfs.dirread(&mut dir)? {
            print_entry(&entry);
        }
    } else {
        print_entry(&entry);
    }
    Ok(())
}

fn print_entry(entry: &FstEntry) {
    let kind = if entry.is_directory() { 'd' } else { 'f' };
    println!(
        "{kind} {:02x}:{:04x}:{:04x} {:>10} {}",
        entry.mode,
        entry.uid,
        entry.gid,
        entry.size,
        entry.name()
    );
}

fn isfs_cat(args: &[String]) -> Result<()> {
    let Some(image) = args.first() else {
        bail!("isfs-cat requires <image> <otp.bin> <volume:/path>");
    };
    let Some(otp_path) = args.get(1) else {
        bail!("isfs-cat requires <image> <otp.bin> <volume:/path>");
    };
    let Some(path) = args.get(2) else {
        bail!("isfs-cat requires <image> <otp.bin> <volume:/path>");
    };
    let mut output = None;
    let mut index = 3_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--output" => {
                output = Some(args.get(index + 1).context("--output requires a value")?);
                index += 2;
            }
            other => {
                bail!("unknown isfs-cat option: {other}");
            }
        }
    }

    let otp = load_otp(otp_path)?;
    let (id, rest) = parse_volume_path(path)?;
    let inner = rest.trim_matches('/');
    if inner.is_empty() {
        bail!("isfs-cat requires a file path inside the volume");
    }

    let isfs = Filesystem::mount(open_volume(image, id)?, &otp)?;
    let mut handle = isfs.open(inner)?;
    let mut data = vec![0_u8; isfs.file_size(&handle)? as usize];
    isfs.read(&mut handle, &mut data)?;

    match output {
        Some(out) => {
            fs::write(out, &data).with_context(|| format!("failed to write {out}"))?;
            println!("wrote {:#x} bytes to {out}", data.len());
        }
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}

fn isfshax_status(args: &[String]) -> Result<()> {
    let Some(image) = args.first() else {
        bail!("isfshax-status requires <image> <otp.bin>");
    };
    let Some(otp_path) = args.get(1) else {
        bail!("isfshax-status requires <image> <otp.bin>");
    };
    let json = args.iter().any(|arg| arg == "--json");

    let otp = load_otp(otp_path)?;
    let mut volume = open_volume(image, VolumeId::Slc)?;
    let report = status(&mut volume, &otp)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "installed: slot {} generation {:#x}",
        report.slot, report.generation.0
    );
    println!("generation_base: {:#x}", report.generation_base.0);
    println!("active_position: {}", report.index);
    for slot in &report.slots {
        let mut line = format!(
            "position {}: slot {} {}",
            slot.position,
            slot.slot,
            condition_label(slot.condition)
        );
        if let Some(generation) = slot.generation {
            line.push_str(&format!(" (generation {:#x})", generation.0));
        }
        if slot.current {
            line.push_str(" [current]");
        }
        if slot.flagged_bad {
            line.push_str(" [flagged bad]");
        }
        if slot.flagged_correctable {
            line.push_str(" [flagged correctable]");
        }
        println!("{line}");
    }
    Ok(())
}

fn condition_label(condition: SlotCondition) -> &'static str {
    match condition {
        SlotCondition::Clean => "clean",
        SlotCondition::Corrected => "corrected",
        SlotCondition::Degraded => "degraded",
        SlotCondition::Unreadable => "unreadable",
        SlotCondition::Skipped => "skipped",
    }
}

#[derive(Debug, Serialize)]
struct PrshDump {
    outcome: InitOutcome,
    header_offset: usize,
    header: PrshHeader,
    entries: Vec<PrshRecord>,
}

fn prsh_dump(args: &[String]) -> Result<()> {
    let Some(window) = args.first() else {
        bail!("prsh-dump requires <window.bin> <otp.bin>");
    };
    let Some(otp_path) = args.get(1) else {
        bail!("prsh-dump requires <window.bin> <otp.bin>");
    };
    let json = args.iter().any(|arg| arg == "--json");

    let bytes = fs::read(window).with_context(|| format!("failed to read {window}"))?;
    let otp = load_otp(otp_path)?;
    let (store, outcome) = PrshStore::init(bytes, &otp)?;

    let dump = PrshDump {
        outcome,
        header_offset: store.header_offset(),
        header: store.header(),
        entries: store.entries()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&dump)?);
        return Ok(());
    }

    println!("table: {}", outcome_label(dump.outcome));
    if dump.outcome == InitOutcome::Recreated {
        println!("  window held no valid table; showing the reseeded bootstrap");
    }
    println!("header_offset: {:#x}", dump.header_offset);
    println!("version: {}", dump.header.version);
    println!(
        "entries: {} of {}",
        dump.header.entries, dump.header.total_entries
    );
    for record in &dump.entries {
        println!(
            "  {:<16} addr {:#010x} size {:#x}",
            record.name, record.data_addr, record.size
        );
    }
    Ok(())
}

fn outcome_label(outcome: InitOutcome) -> &'static str {
    match outcome {
        InitOutcome::Inherited => "inherited",
        InitOutcome::Recreated => "recreated",
    }
}
