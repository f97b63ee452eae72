use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use evobus::catalog::{CommandCatalog, CommandName};
use evobus::config::DEFAULT_GATEWAY;
use evobus::decoders::decode;
use evobus::measurement::{MeasurementSink, MemorySink};
use evobus::protocol::{
    DeviceAddress, MessageType, Payload, PendingCommand, TelegramEncoder, TelegramParser,
};
use evobus::state::JsonFileSnapshotStore;
use evobus::zones::{ZoneRecord, ZoneStore};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use tracing::Level;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("evobus")
        .version("0.1.0")
        .author("Home Heating Systems Team")
        .about("Offline tools for Evohome bus captures")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Show decoder logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("Decode a capture file and print the resulting zone table")
                .arg(
                    Arg::with_name("input")
                        .help("Capture file, one bus line per line; stdin when omitted or '-'")
                        .index(1),
                )
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .value_name("FORMAT")
                        .help("Output format")
                        .takes_value(true)
                        .possible_values(&["table", "json"])
                        .default_value("table"),
                )
                .arg(
                    Arg::with_name("state-file")
                        .long("state-file")
                        .value_name("FILE")
                        .help("Seed zones from this snapshot before decoding")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("encode")
                .about("Render the wire line for an outbound command")
                .arg(
                    Arg::with_name("command")
                        .help("Command name, e.g. zone_name")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("destination")
                        .help("Destination address, e.g. 01:160371")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("payload")
                        .help("Payload bytes as hex")
                        .index(3)
                        .default_value(""),
                )
                .arg(
                    Arg::with_name("type")
                        .short("t")
                        .long("type")
                        .value_name("TYPE")
                        .help("Message type")
                        .takes_value(true)
                        .possible_values(&["I", "W", "RQ", "RP"])
                        .default_value("RQ"),
                )
                .arg(
                    Arg::with_name("gateway")
                        .short("g")
                        .long("gateway")
                        .value_name("ADDRESS")
                        .help("Sending address")
                        .takes_value(true)
                        .default_value(DEFAULT_GATEWAY),
                )
                .arg(
                    Arg::with_name("broadcast")
                        .long("broadcast")
                        .help("Address the command to every device"),
                ),
        )
        .get_matches();

    if matches.is_present("verbose") {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_writer(io::stderr)
            .init();
    }

    match matches.subcommand() {
        ("decode", Some(sub)) => decode_capture(sub),
        ("encode", Some(sub)) => encode_command(sub),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            Ok(())
        }
    }
}

fn decode_capture(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn BufRead> = match matches.value_of("input") {
        None | Some("-") => Box::new(BufReader::new(io::stdin())),
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
    };

    let mut store = match matches.value_of("state-file") {
        Some(path) => {
            ZoneStore::from_snapshot(JsonFileSnapshotStore::new(path).load_or_default()?)
        }
        None => ZoneStore::new(),
    };
    let parser = TelegramParser::new(Arc::new(CommandCatalog::new()))?;
    let mut sink = MemorySink::new();
    let json = matches.value_of("format") == Some("json");

    let (mut parsed, mut dropped) = (0usize, 0usize);
    for line in reader.lines() {
        let line = line?;
        let telegram = match parser.parse(&line) {
            Ok(telegram) => telegram,
            Err(e) => {
                dropped += 1;
                if !json {
                    println!("{} {} ({})", "✗".red(), line.dimmed(), e);
                }
                continue;
            }
        };
        parsed += 1;

        let outcome = decode(&telegram, &mut store);
        sink.insert(&outcome.measurements)?;
        if json {
            continue;
        }

        let marker = if outcome.fallback { "·".dimmed() } else { "✓".green() };
        println!(
            "{} {:>2} {:<16} {} -> {} {}",
            marker,
            telegram.message_type.as_str().bright_white(),
            telegram.command.as_str().bright_cyan(),
            telegram.source_label(),
            telegram.destination_label(),
            telegram.payload.dimmed()
        );
        for follow_up in &outcome.follow_ups {
            println!("    {} queue {}", "↻".yellow(), follow_up.command().command);
        }
    }

    if json {
        let report = serde_json::json!({
            "parsed": parsed,
            "dropped": dropped,
            "zones": store.snapshot(),
            "measurements": sink.rows(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("{}", "Zones".bright_blue().bold());
    print_zone_table(&store.snapshot());
    println!(
        "\n{} telegrams, {} dropped, {} measurements",
        parsed.to_string().bright_green(),
        dropped.to_string().bright_red(),
        sink.rows().len().to_string().bright_cyan()
    );
    Ok(())
}

fn print_zone_table(zones: &[ZoneRecord]) {
    println!(
        "{:>4}  {:<20} {:>7} {:>7} {:>8} {:>8} {:>7}",
        "id", "name", "min", "max", "temp", "setpoint", "demand"
    );
    for zone in zones {
        println!(
            "{:>4}  {:<20} {:>7} {:>7} {:>8} {:>8} {:>7}",
            zone.id,
            zone.name().unwrap_or("-"),
            format_degrees(zone.bounds_known().then(|| zone.min_temperature)),
            format_degrees(zone.bounds_known().then(|| zone.max_temperature)),
            format_degrees(zone.temperature),
            format_degrees(zone.setpoint),
            zone.heat_demand
                .map(|d| format!("{:.1}%", d))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

fn format_degrees(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "-".to_string())
}

fn encode_command(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let command: CommandName = matches.value_of("command").unwrap_or_default().parse()?;
    let destination: DeviceAddress = matches.value_of("destination").unwrap_or_default().parse()?;
    let gateway: DeviceAddress = matches.value_of("gateway").unwrap_or(DEFAULT_GATEWAY).parse()?;
    let message_type: MessageType = matches.value_of("type").unwrap_or("RQ").parse()?;
    let payload = hex::decode(matches.value_of("payload").unwrap_or_default())?;

    let pending = PendingCommand {
        message_type,
        command,
        destination,
        broadcast: matches.is_present("broadcast"),
        payload: Payload::new(&payload),
    };

    let encoder = TelegramEncoder::new(Arc::new(CommandCatalog::new()), gateway);
    let line = encoder.encode(&pending)?;
    println!("{}", line);
    Ok(())
}
