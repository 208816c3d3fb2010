//! Property tests for exclusive access
//!
//! Arbitrary interleavings of opens and closes, checked against a model
//! of the two slots: an open succeeds exactly when every slot its mode
//! needs is free, and closing every session leaves both slots free.

use common::{AccessMode, Error};
use osrfx2::test_utils::{MockBackend, fast_settings};
use osrfx2::usb::{DeviceRegistry, ExclusiveGate, GateSlots, LifecycleController};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Open(AccessMode),
    Close(usize),
}

fn mode_strategy() -> impl Strategy<Value = AccessMode> {
    prop_oneof![
        Just(AccessMode::Read),
        Just(AccessMode::Write),
        Just(AccessMode::ReadWrite),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        mode_strategy().prop_map(Op::Open),
        any::<usize>().prop_map(Op::Close),
    ]
}

/// Slots held according to the model
#[derive(Debug, Default)]
struct Model {
    read: bool,
    write: bool,
}

impl Model {
    fn can_open(&self, mode: AccessMode) -> bool {
        !(mode.is_read() && self.read) && !(mode.is_write() && self.write)
    }

    fn take(&mut self, mode: AccessMode) {
        self.read |= mode.is_read();
        self.write |= mode.is_write();
    }

    fn give_back(&mut self, mode: AccessMode) {
        if mode.is_read() {
            self.read = false;
        }
        if mode.is_write() {
            self.write = false;
        }
    }
}

proptest! {
    /// Property: the gate agrees with the model after every operation
    #[test]
    fn prop_gate_matches_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
        let gate = ExclusiveGate::new();
        let mut model = Model::default();
        let mut held: Vec<(AccessMode, GateSlots)> = Vec::new();

        for op in ops {
            match op {
                Op::Open(mode) => {
                    let expected = model.can_open(mode);
                    match gate.acquire(mode) {
                        Ok(slots) => {
                            prop_assert!(expected, "{} open succeeded with {:?}", mode, model);
                            prop_assert_eq!(slots.read, mode.is_read());
                            prop_assert_eq!(slots.write, mode.is_write());
                            model.take(mode);
                            held.push((mode, slots));
                        }
                        Err(e) => {
                            prop_assert!(!expected, "{} open failed with {:?}", mode, model);
                            prop_assert!(matches!(e, Error::DeviceBusy));
                        }
                    }
                }
                Op::Close(index) if !held.is_empty() => {
                    let (mode, slots) = held.remove(index % held.len());
                    gate.release(slots);
                    model.give_back(mode);
                }
                Op::Close(_) => {}
            }

            prop_assert_eq!(gate.read_held(), model.read);
            prop_assert_eq!(gate.write_held(), model.write);
        }

        for (_, slots) in held.drain(..) {
            gate.release(slots);
        }
        prop_assert!(!gate.read_held());
        prop_assert!(!gate.write_held());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: sessions hold exactly their mode's slots and give them
    /// back on close
    #[test]
    fn prop_sessions_release_on_close(ops in proptest::collection::vec(op_strategy(), 0..32)) {
        let controller = LifecycleController::new(DeviceRegistry::new(192, 1), fast_settings());
        let id = controller.attach(Arc::new(MockBackend::osrfx2())).unwrap();
        let context = controller.find(id).unwrap();
        let mut model = Model::default();
        let mut sessions = Vec::new();

        for op in ops {
            match op {
                Op::Open(mode) => {
                    let expected = model.can_open(mode);
                    match controller.open(id, mode) {
                        Ok(session) => {
                            prop_assert!(expected);
                            model.take(mode);
                            sessions.push(session);
                        }
                        Err(e) => {
                            prop_assert!(!expected);
                            prop_assert!(matches!(e, Error::DeviceBusy));
                        }
                    }
                }
                Op::Close(index) if !sessions.is_empty() => {
                    let session = sessions.remove(index % sessions.len());
                    model.give_back(session.mode());
                    session.close();
                }
                Op::Close(_) => {}
            }

            prop_assert_eq!(context.gate().read_held(), model.read);
            prop_assert_eq!(context.gate().write_held(), model.write);
        }

        sessions.clear();
        prop_assert!(!context.gate().read_held());
        prop_assert!(!context.gate().write_held());

        drop(context);
        controller.detach(id).unwrap();
    }
}
