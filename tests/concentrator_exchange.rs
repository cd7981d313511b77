mod common;

use common::*;
use woisradio::host::{Fault, Irrigation, Moisture, ZoneSensor, ZoneSensors};
use woisradio::protocol::{CommandMessage, Message, ScInstruction, SC_OP_ACK, SC_OP_REQUEST};
use woisradio::radio::RadioTuning;

const HUB_A: u64 = 0x0013_A200_4100_000A;
const HUB_B: u64 = 0x0013_A200_4100_000B;
const HUB_C: u64 = 0x0013_A200_4100_000C;

fn assoc(msg_id: u8) -> Message {
    Message::ScAssoc(CommandMessage::new(msg_id, SC_OP_REQUEST, &[3, 0x0F, 0x3C]))
}

fn status(msg_id: u8, readings: [u16; 4]) -> Message {
    let mut data = vec![40, 0x0E, 0xD8];
    for value in readings {
        data.extend_from_slice(&value.to_be_bytes());
    }
    Message::ScStatus(CommandMessage::new(msg_id, SC_OP_REQUEST, &data))
}

fn replies_to(engine: &mut Engine, mac: u64) -> Vec<Message> {
    sent(engine)
        .into_iter()
        .filter(|(dest, _)| *dest == mac)
        .map(|(_, msg)| msg)
        .collect()
}

/// Master with the given hubs accepted in order.
fn master_with_hubs(hubs: &[u64]) -> Engine {
    let mut master = master(0);
    master.set_association_mode(true);
    for &hub in hubs {
        deliver(&mut master, hub, &assoc(0));
        assert_eq!(master.concentrators().pending(), Some(hub));
        assert!(master.accept_pending().is_some());
    }
    master.set_association_mode(false);
    let _ = sent(&mut master);
    master
}

#[test]
fn unknown_hub_waits_for_acceptance() {
    let mut master = master(0);
    deliver(&mut master, HUB_A, &assoc(1));
    assert_eq!(master.concentrators().pending(), None, "association mode is off");
    assert!(replies_to(&mut master, HUB_A).is_empty());

    master.set_association_mode(true);
    deliver(&mut master, HUB_A, &assoc(2));
    deliver(&mut master, HUB_B, &assoc(3));
    assert_eq!(master.concentrators().pending(), Some(HUB_A));
    master.reject_pending();
    assert_eq!(master.concentrators().pending(), None);
    assert!(master.concentrators().table().is_empty());
}

#[test]
fn accepted_hub_gets_its_schedule() {
    let mut master = master_with_hubs(&[HUB_A]);
    deliver(&mut master, HUB_A, &assoc(0x21));
    let replies = replies_to(&mut master, HUB_A);
    let Some(Message::ScAssoc(ack)) = replies.first() else {
        panic!("expected SC_ASSOC ack, got {:?}", replies);
    };
    let tuning = RadioTuning::default();
    assert_eq!(ack.msg_id, 0x21);
    assert_eq!(ack.cmd, SC_OP_ACK);
    assert_eq!(ack.data.len(), 15);
    assert_eq!(u16::from_be_bytes([ack.data[8], ack.data[9]]), tuning.idle_sleep_s);
    assert_eq!(u16::from_be_bytes([ack.data[10], ack.data[11]]), tuning.hibernate_threshold_mv);
    assert_eq!(u16::from_be_bytes([ack.data[12], ack.data[13]]), tuning.hibernate_sleep_s);
    assert_eq!(ack.data[14], 0);
}

#[test]
fn sixth_reassociation_without_status_resets_the_radio() {
    let mut master = master_with_hubs(&[HUB_A]);
    let limit = RadioTuning::default().reassociation_limit;
    for i in 1..limit {
        deliver(&mut master, HUB_A, &assoc(i));
        assert_eq!(replies_to(&mut master, HUB_A).len(), 1);
    }
    assert_eq!(master.transport().reset_count(), 0);

    deliver(&mut master, HUB_A, &assoc(limit));
    assert_eq!(master.transport().reset_count(), 1);
    assert!(replies_to(&mut master, HUB_A).is_empty());
    let runtime = master.concentrators().table().runtime(0).expect("slot 0");
    assert_eq!(runtime.reassociation_count, 0);
}

#[test]
fn status_resets_the_reassociation_counter() {
    let mut master = master_with_hubs(&[HUB_A]);
    for i in 0..10u8 {
        deliver(&mut master, HUB_A, &assoc(i));
        deliver(&mut master, HUB_A, &status(i, [0xFFFF; 4]));
    }
    assert_eq!(master.transport().reset_count(), 0);
}

#[test]
fn status_updates_moisture_of_mapped_zones() {
    let mut master = master_with_hubs(&[HUB_A]);
    assert!(master.assign_channel(0, 0, 3));
    assert!(master.assign_channel(0, 2, 7));
    deliver(&mut master, HUB_A, &status(5, [412, 999, 530, 0xFFFF]));

    assert_eq!(master.host().moisture_value(3), Some(412));
    assert_eq!(master.host().moisture_value(7), Some(530));
    assert_eq!(master.host().moisture_value(1), None);

    let replies = replies_to(&mut master, HUB_A);
    let Some(Message::ScStatus(ack)) = replies.first() else {
        panic!("expected SC_STATUS ack");
    };
    assert_eq!(ack.msg_id, 5);
    assert_eq!(ack.data[0], ScInstruction::Normal as u8);
}

#[test]
fn sleep_follows_irrigation_state() {
    let mut master = master_with_hubs(&[HUB_A]);
    let tuning = RadioTuning::default();
    let sleep_of = |master: &mut Engine| match replies_to(master, HUB_A).first() {
        Some(Message::ScStatus(ack)) => u16::from_be_bytes([ack.data[1], ack.data[2]]),
        other => panic!("expected SC_STATUS ack, got {:?}", other),
    };

    deliver(&mut master, HUB_A, &status(1, [0xFFFF; 4]));
    assert_eq!(sleep_of(&mut master), tuning.idle_sleep_s);

    master.host_mut().manual_start(1);
    deliver(&mut master, HUB_A, &status(2, [0xFFFF; 4]));
    assert_eq!(sleep_of(&mut master), tuning.irrigating_sleep_s);

    master.host_mut().finish_irrigation();
    master.host_mut().set_inhibit(true);
    deliver(&mut master, HUB_A, &status(3, [0xFFFF; 4]));
    assert_eq!(sleep_of(&mut master), tuning.inhibit_sleep_s);
}

#[test]
fn deleting_a_hub_compacts_the_table() {
    let mut master = master_with_hubs(&[HUB_A, HUB_B, HUB_C]);
    assert!(master.assign_channel(1, 0, 4));
    assert!(master.assign_channel(2, 1, 5));
    assert!(master.mark_for_deletion(HUB_A));

    deliver(&mut master, HUB_A, &status(9, [0xFFFF; 4]));
    let replies = replies_to(&mut master, HUB_A);
    let Some(Message::ScStatus(ack)) = replies.first() else {
        panic!("expected deassociate reply");
    };
    assert_eq!(ack.data[0], ScInstruction::Deassociate as u8);

    let table = master.concentrators().table();
    assert_eq!(table.len(), 2);
    assert!(table.is_compact());
    assert_eq!(table.find(HUB_A), None);
    assert_eq!(table.find(HUB_B), Some(0));
    assert_eq!(table.find(HUB_C), Some(1));
    assert_eq!(master.host().zone_sensor(4), ZoneSensor::Wireless { slot: 0, channel: 0 });
    assert_eq!(master.host().zone_sensor(5), ZoneSensor::Wireless { slot: 1, channel: 1 });
}

#[test]
fn solenoid_override_drives_wired_relays() {
    let mut master = master_with_hubs(&[HUB_A]);
    assert!(master.assign_channel(0, 0, 2));
    assert!(master.assign_channel(0, 1, 3));
    assert!(master.sensor_concentrator_solenoid_override(0, 0b0001));

    deliver(&mut master, HUB_A, &status(1, [0xFFFF; 4]));
    assert!(master.host().relay(2));
    assert!(!master.host().relay(3));
    match replies_to(&mut master, HUB_A).first() {
        Some(Message::ScStatus(ack)) => assert_eq!(ack.data[3], 0b0001),
        other => panic!("expected SC_STATUS ack, got {:?}", other),
    }

    assert!(master.sensor_concentrator_solenoid_override(0, 0));
    assert!(!master.host().relay(2));
    assert!(!master.sensor_concentrator_solenoid_override(4, 1));
}

#[test]
fn silent_hub_is_faulted_and_recovers_on_status() {
    let mut master = master_with_hubs(&[HUB_A]);
    deliver(&mut master, HUB_A, &assoc(1));
    let _ = sent(&mut master);
    let timeout = RadioTuning::default().concentrator_timeout_ms;

    master.host_mut().advance(timeout + 1);
    master.poll();
    assert!(master.host().has_fault(Fault::ConcentratorTimeout(0)));

    deliver(&mut master, HUB_A, &status(2, [0xFFFF; 4]));
    assert!(!master.host().has_fault(Fault::ConcentratorTimeout(0)));
    assert_eq!(master.host().zone_count(), 24);
}

#[test]
fn timeout_faults_follow_hubs_down_on_compaction() {
    let mut master = master_with_hubs(&[HUB_A, HUB_B, HUB_C]);
    for hub in [HUB_A, HUB_B, HUB_C] {
        deliver(&mut master, hub, &assoc(1));
    }
    let _ = sent(&mut master);
    master.host_mut().advance(RadioTuning::default().concentrator_timeout_ms + 1);
    master.poll();
    for slot in 0..3 {
        assert!(master.host().has_fault(Fault::ConcentratorTimeout(slot)));
    }

    assert!(master.mark_for_deletion(HUB_A));
    deliver(&mut master, HUB_A, &status(2, [0xFFFF; 4]));
    assert_eq!(master.concentrators().table().len(), 2);
    // B and C are still silent, now in slots 0 and 1.
    assert!(master.host().has_fault(Fault::ConcentratorTimeout(0)));
    assert!(master.host().has_fault(Fault::ConcentratorTimeout(1)));
    assert!(!master.host().has_fault(Fault::ConcentratorTimeout(2)));

    deliver(&mut master, HUB_B, &status(3, [0xFFFF; 4]));
    deliver(&mut master, HUB_C, &status(4, [0xFFFF; 4]));
    assert!(master.host().faults().is_empty());
}

#[test]
fn silent_hub_can_be_removed_without_its_status() {
    let mut master = master_with_hubs(&[HUB_A, HUB_B]);
    assert!(master.assign_channel(0, 0, 2));
    assert!(master.assign_channel(1, 3, 6));
    deliver(&mut master, HUB_A, &assoc(1));
    let _ = sent(&mut master);
    master.host_mut().advance(RadioTuning::default().concentrator_timeout_ms + 1);
    master.poll();
    assert!(master.host().has_fault(Fault::ConcentratorTimeout(0)));

    assert!(master.remove_concentrator(HUB_A));
    assert!(!master.remove_concentrator(HUB_A));
    assert!(replies_to(&mut master, HUB_A).is_empty());

    let table = master.concentrators().table();
    assert_eq!(table.len(), 1);
    assert!(table.is_compact());
    assert_eq!(table.find(HUB_B), Some(0));
    assert_eq!(master.host().zone_sensor(2), ZoneSensor::None);
    assert_eq!(master.host().zone_sensor(6), ZoneSensor::Wireless { slot: 0, channel: 3 });
    assert!(!master.host().has_fault(Fault::ConcentratorTimeout(0)));
}
