use evobus::catalog::{CommandCatalog, CommandName};
use evobus::decoders::{decode, FollowUp};
use evobus::protocol::{Telegram, TelegramParser};
use evobus::zones::{default_snapshot, ZoneStore, OPENTHERM_ZONE_ID};
use std::sync::Arc;

fn telegram(line: &str) -> Telegram {
    TelegramParser::new(Arc::new(CommandCatalog::new()))
        .unwrap()
        .parse(line)
        .unwrap()
}

/// Controller broadcast carrying `payload` for command `code`.
fn broadcast(code: &str, payload: &str) -> Telegram {
    telegram(&format!(
        "045  I --- 01:160371 --:------ 01:160371 {} {:03} {}",
        code,
        payload.len() / 2,
        payload
    ))
}

/// Controller response to the gateway.
fn response(code: &str, payload: &str) -> Telegram {
    telegram(&format!(
        "053 RP --- 01:160371 18:000730 --:------ {} {:03} {}",
        code,
        payload.len() / 2,
        payload
    ))
}

#[test]
fn test_zone_temperature_broadcast_updates_two_zones() {
    let mut store = ZoneStore::new();
    let outcome = decode(&broadcast("30C9", "0008020B0834"), &mut store);

    assert!(!outcome.fallback);
    assert!(outcome.zones_changed);
    assert_eq!(store.get(0).and_then(|z| z.temperature), Some(20.5));
    assert_eq!(store.get(11).and_then(|z| z.temperature), Some(21.0));

    assert_eq!(outcome.measurements.len(), 2);
    let first = &outcome.measurements[0];
    assert_eq!(first.command, "zone_temperature");
    assert_eq!(first.message_type, "I");
    assert_eq!(first.source_type, "CTL");
    assert_eq!(first.source_id, "160371");
    assert!(first.broadcast);
    assert_eq!(first.zone_id, Some(0));
    assert_eq!(first.temperature, Some(20.5));
    assert_eq!(outcome.measurements[1].zone_id, Some(11));
}

#[test]
fn test_zone_temperature_is_idempotent() {
    let mut store = ZoneStore::new();
    let line = broadcast("30C9", "000802");

    decode(&line, &mut store);
    let after_first = store.snapshot();
    decode(&line, &mut store);
    assert_eq!(store.snapshot(), after_first);
}

#[test]
fn test_sanity_ceiling_boundary() {
    let mut store = ZoneStore::new();

    // 100.00 is still plausible
    decode(&broadcast("30C9", "022710"), &mut store);
    assert_eq!(store.get(2).and_then(|z| z.temperature), Some(100.0));

    decode(&broadcast("30C9", "020834"), &mut store);
    let outcome = decode(&broadcast("30C9", "022711"), &mut store);
    assert!(outcome.measurements.is_empty());
    assert!(!outcome.zones_changed);
    assert_eq!(store.get(2).and_then(|z| z.temperature), Some(21.0));
}

#[test]
fn test_setpoint_sanity_ceiling() {
    let mut store = ZoneStore::new();

    decode(&broadcast("2309", "042710"), &mut store);
    assert_eq!(store.get(4).and_then(|z| z.setpoint), Some(100.0));

    let outcome = decode(&broadcast("2309", "042711"), &mut store);
    assert!(outcome.measurements.is_empty());
    assert!(!outcome.zones_changed);
    assert_eq!(store.get(4).and_then(|z| z.setpoint), Some(100.0));
}

#[test]
fn test_setpoint_gated_by_known_bounds() {
    let mut store = ZoneStore::new();

    // accepted while bounds are unknown
    decode(&broadcast("2309", "030FA0"), &mut store);
    assert_eq!(store.get(3).and_then(|z| z.setpoint), Some(40.0));

    decode(&response("000A", "031001F40DAC"), &mut store);
    let zone = store.get(3).unwrap();
    assert_eq!(zone.min_temperature, 5.0);
    assert_eq!(zone.max_temperature, 35.0);

    let outcome = decode(&broadcast("2309", "030FA0"), &mut store);
    assert!(outcome.measurements.is_empty());
    assert_eq!(store.get(3).and_then(|z| z.setpoint), Some(40.0));

    let outcome = decode(&broadcast("2309", "0307D0"), &mut store);
    assert_eq!(outcome.measurements.len(), 1);
    assert_eq!(outcome.measurements[0].setpoint, Some(20.0));
    assert_eq!(store.get(3).and_then(|z| z.setpoint), Some(20.0));
}

#[test]
fn test_zone_info_sets_bounds() {
    let mut store = ZoneStore::new();
    let outcome = decode(&response("000A", "001001F40DAC"), &mut store);

    assert!(outcome.zones_changed);
    assert!(outcome.measurements.is_empty());
    let zone = store.get(0).unwrap();
    assert!(zone.bounds_known());
    assert_eq!((zone.min_temperature, zone.max_temperature), (5.0, 35.0));
}

#[test]
fn test_zone_info_with_several_blocks() {
    let mut store = ZoneStore::new();
    let outcome = decode(&response("000A", "001001F40DAC011001F40BB8"), &mut store);

    assert!(!outcome.fallback);
    assert!(outcome.zones_changed);
    let first = store.get(0).unwrap();
    assert_eq!((first.min_temperature, first.max_temperature), (5.0, 35.0));
    let second = store.get(1).unwrap();
    assert_eq!((second.min_temperature, second.max_temperature), (5.0, 30.0));
}

#[test]
fn test_relay_heat_demand_percentage() {
    let mut store = ZoneStore::new();
    let outcome = decode(
        &telegram("045  I --- 13:123456 --:------ 13:123456 0008 002 0064"),
        &mut store,
    );

    assert!(!outcome.fallback);
    assert_eq!(store.get(0).and_then(|z| z.heat_demand), Some(50.0));
    assert_eq!(outcome.measurements.len(), 1);
    assert_eq!(outcome.measurements[0].command, "relay_heat_demand");
    assert_eq!(outcome.measurements[0].source_type, "BDR");
    assert_eq!(outcome.measurements[0].demand_percentage, Some(50.0));
}

#[test]
fn test_heat_demand_above_full_scale_is_rejected() {
    let mut store = ZoneStore::new();
    decode(
        &telegram("061  I --- 04:052312 --:------ 04:052312 3150 002 0264"),
        &mut store,
    );
    assert_eq!(store.get(2).and_then(|z| z.heat_demand), Some(50.0));

    let outcome = decode(
        &telegram("061  I --- 04:052312 --:------ 04:052312 3150 002 02C9"),
        &mut store,
    );
    assert!(!outcome.fallback);
    assert!(!outcome.zones_changed);
    assert!(outcome.measurements.is_empty());
    assert_eq!(store.get(2).and_then(|z| z.heat_demand), Some(50.0));
}

#[test]
fn test_heat_demand_percentage() {
    let mut store = ZoneStore::new();
    let outcome = decode(
        &telegram("061  I --- 04:052312 --:------ 04:052312 3150 002 00C8"),
        &mut store,
    );

    assert_eq!(store.get(0).and_then(|z| z.heat_demand), Some(100.0));
    assert_eq!(outcome.measurements.len(), 1);
    assert_eq!(outcome.measurements[0].demand_percentage, Some(100.0));
    assert_eq!(outcome.measurements[0].source_type, "TRV");
}

#[test]
fn test_undecodable_zone_name_requests_one_repair() {
    let mut store = ZoneStore::new();
    let payload = format!("0100{}", "ZZ".repeat(20));
    let outcome = decode(&response("0004", &payload), &mut store);

    assert!(store.get(1).is_none());
    assert!(!outcome.zones_changed);
    assert_eq!(outcome.follow_ups.len(), 1);
    match &outcome.follow_ups[0] {
        FollowUp::ZoneNameRepair { zone_id, command } => {
            assert_eq!(*zone_id, 1);
            assert_eq!(command.command, CommandName::ZoneName);
            assert_eq!(command.payload.bytes(), &[1, 0]);
        }
        other => panic!("Expected zone name repair, got {:?}", other),
    }
}

#[test]
fn test_zone_name_is_recorded() {
    let mut store = ZoneStore::new();
    let outcome = decode(
        &response("0004", "01004C6F676565726B616D6572000000000000000000"),
        &mut store,
    );

    assert_eq!(outcome.named_zone, Some(1));
    assert_eq!(store.get(1).and_then(|z| z.name()), Some("Logeerkamer"));

    // later readings carry the name
    let outcome = decode(&broadcast("30C9", "010802"), &mut store);
    assert_eq!(outcome.measurements[0].zone_name.as_deref(), Some("Logeerkamer"));
}

#[test]
fn test_device_walk_requests_next_address() {
    let mut store = ZoneStore::new();
    let outcome = decode(
        &response("0418", "000005000001000000000000000000000000000A1B2C"),
        &mut store,
    );

    assert_eq!(outcome.follow_ups.len(), 1);
    match &outcome.follow_ups[0] {
        FollowUp::DeviceWalk(command) => {
            assert_eq!(command.command, CommandName::DeviceInfo);
            assert_eq!(command.payload.bytes(), &[0, 0, 6]);
        }
        other => panic!("Expected device walk, got {:?}", other),
    }
}

#[test]
fn test_device_walk_stops_at_empty_slot() {
    let mut store = ZoneStore::new();
    let outcome = decode(
        &response("0418", "00000000000000000000000000000000000000000000"),
        &mut store,
    );
    assert!(outcome.follow_ups.is_empty());
    assert!(!outcome.fallback);
}

#[test]
fn test_non_controller_source_falls_back() {
    let mut store = ZoneStore::new();
    let outcome = decode(
        &telegram("045  I --- 04:052312 --:------ 04:052312 30C9 003 000834"),
        &mut store,
    );
    assert!(outcome.fallback);
    assert!(store.is_empty());
}

#[test]
fn test_bad_payload_shape_falls_back_without_mutation() {
    let mut store = ZoneStore::new();

    // declared two blocks, carries one and a half
    let outcome = decode(
        &telegram("045  I --- 01:160371 --:------ 01:160371 30C9 006 0008020B08"),
        &mut store,
    );
    assert!(outcome.fallback);
    assert!(store.is_empty());

    // second block is not hex; the first must not be applied either
    let outcome = decode(&broadcast("30C9", "0008020BXX34"), &mut store);
    assert!(outcome.fallback);
    assert!(store.is_empty());
}

#[test]
fn test_unknown_command_falls_back() {
    let mut store = ZoneStore::new();
    let outcome = decode(&broadcast("FFFF", "00"), &mut store);
    assert!(outcome.fallback);
    assert!(outcome.measurements.is_empty());
}

#[test]
fn test_pseudo_zone_reported_only_when_named() {
    let mut store = ZoneStore::new();
    let outcome = decode(&broadcast("30C9", "FC0834"), &mut store);
    assert!(outcome.zones_changed);
    assert!(outcome.measurements.is_empty());

    let mut seeded = ZoneStore::from_snapshot(default_snapshot());
    let outcome = decode(&broadcast("30C9", "FC0834"), &mut seeded);
    assert_eq!(outcome.measurements.len(), 1);
    assert_eq!(outcome.measurements[0].zone_id, Some(OPENTHERM_ZONE_ID));
    assert_eq!(outcome.measurements[0].zone_name.as_deref(), Some("Opentherm"));
}
