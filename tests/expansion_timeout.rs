mod common;

use common::*;
use woisradio::host::{Fault, Irrigation};
use woisradio::protocol::{Command, UnitId};
use woisradio::radio::RadioTuning;

/// Hand the baton past EXP1 so that EXP2 holds it and owes us an ack.
fn master_waiting_on_exp2() -> Engine {
    let mut master = master(3);
    master.host_mut().manual_start(2);
    master.on_local_irrigation_complete();
    let out = sent(&mut master);
    let baton = &commands_to(&out, EXP1_MAC)[0];
    deliver(&mut master, EXP1_MAC, &unit_ack(baton.msg_id, Command::BatonStart.ack_code(), &[]));
    deliver(&mut master, EXP1_MAC, &command(1, Command::IrrComplete.opcode(), &[]));
    let _ = sent(&mut master);

    assert_eq!(master.current_irrigator(), UnitId::Exp2);
    assert!(master.expansion_status(UnitId::Exp2).awaiting_response);
    master
}

#[test]
fn silent_expansion_loses_the_baton() {
    let mut master = master_waiting_on_exp2();
    let timeout = RadioTuning::default().expansion_timeout_ms;

    master.host_mut().advance(timeout);
    master.poll();
    assert!(!master.host().has_fault(Fault::ExpansionTimeout(UnitId::Exp2)));

    master.host_mut().advance(1);
    master.poll();
    let status = master.expansion_status(UnitId::Exp2);
    assert!(master.host().has_fault(Fault::ExpansionTimeout(UnitId::Exp2)));
    assert_eq!(master.current_irrigator(), UnitId::Master);
    assert!(!master.host().pulse_mode());
    assert!(!status.connected);
    assert!(status.faulted);
    assert!(!status.awaiting_response);
}

#[test]
fn any_valid_message_clears_the_fault() {
    let mut master = master_waiting_on_exp2();
    master.host_mut().advance(20_000);
    master.poll();
    assert!(master.host().has_fault(Fault::ExpansionTimeout(UnitId::Exp2)));

    deliver(&mut master, EXP2_MAC, &command(3, Command::Noop.opcode(), &[]));
    assert!(!master.host().has_fault(Fault::ExpansionTimeout(UnitId::Exp2)));
    let status = master.expansion_status(UnitId::Exp2);
    assert!(status.connected);
    assert!(!status.faulted);
}

#[test]
fn fault_does_not_touch_other_units() {
    let mut master = master_waiting_on_exp2();
    master.host_mut().advance(20_000);
    master.poll();
    assert!(!master.host().has_fault(Fault::ExpansionTimeout(UnitId::Exp1)));
    assert!(!master.host().has_fault(Fault::ExpansionTimeout(UnitId::Exp3)));
    assert!(master.expansion_status(UnitId::Exp1).connected);
}
