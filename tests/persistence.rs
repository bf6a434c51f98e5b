//! Restart behaviour: state-file round-trips and the no-op reconcile that
//! keeps hardware untouched across a process restart.

use chrono::{TimeZone, Utc};
use tempfile::tempdir;
use uuid::Uuid;

use power_controller::controller::{Action, Gates, OutputMachine};
use power_controller::domain::{AntiChatter, OffTimer, RelayState};
use power_controller::store::{PersistedState, StateStore};

#[test]
fn state_survives_write_read_cycle() {
    let dir = tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"), 30);

    let mut state = PersistedState::empty();
    {
        let out = state.output_mut("pool-pump");
        out.relay = RelayState::On;
        out.on_seconds_today = 7200;
        out.shortfall_hours = 0.5;
        out.last_change = Some(Utc.with_ymd_and_hms(2025, 6, 2, 7, 45, 0).unwrap());
    }
    store.save(&mut state).unwrap();

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.outputs, state.outputs);
}

#[test]
fn saving_twice_is_idempotent_for_outputs() {
    let dir = tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"), 30);

    let mut state = PersistedState::empty();
    state.output_mut("pool-pump").relay = RelayState::Off;
    store.save(&mut state).unwrap();
    let first = store.load().unwrap();
    let mut second_doc = first.clone();
    store.save(&mut second_doc).unwrap();
    let second = store.load().unwrap();
    assert_eq!(first.outputs, second.outputs);
}

#[test]
fn restart_with_agreeing_plan_does_not_actuate() {
    // The relay was ON when the process stopped and the plan still says
    // ON: a rebuilt machine must issue no command.
    let now = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
    let chatter = AntiChatter {
        min_on_minutes: 10,
        off_timer: OffTimer::MinOff { minutes: 10 },
    };
    let mut machine = OutputMachine::new(chatter, Some(true), now);
    assert!(machine.is_on());
    assert_eq!(
        machine.step(now, Gates { want_on: true, ignore_locks: false }),
        None
    );

    // And the opposite: relay OFF, plan OFF, nothing to do.
    let mut machine = OutputMachine::new(chatter, Some(false), now);
    assert_eq!(
        machine.step(now, Gates { want_on: false, ignore_locks: false }),
        None
    );

    // Only a real disagreement produces a command.
    let mut machine = OutputMachine::new(chatter, Some(false), now);
    assert_eq!(
        machine.step(now, Gates { want_on: true, ignore_locks: false }),
        Some(Action::TurnOn)
    );
    machine.begin(Action::TurnOn, Uuid::new_v4());
    assert_eq!(
        machine.step(now, Gates { want_on: true, ignore_locks: false }),
        None,
        "at most one in-flight command per output"
    );
}
