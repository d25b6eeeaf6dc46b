//! Two in-memory processes wired to one controller through loopback
//! channels, stepped one tick at a time.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use starlift_controller::TransferController;
use starlift_controller::channel::{LoopbackChannel, SharedChannel};
use starlift_controller::config::ControllerConfig;
use starlift_controller::transfer::TransferState;
use starlift_core::config::TransferConfig;
use starlift_core::id::{InstanceId, TransferId};
use starlift_core::instance::Instance;
use starlift_core::model::VerificationTotals;
use starlift_core::scanner::live_totals;
use starlift_core::test_utils::MemoryWorld;
use starlift_core::world::World;

pub type Shared = Rc<RefCell<Instance<MemoryWorld>>>;

pub const SOURCE: InstanceId = InstanceId(1);
pub const DESTINATION: InstanceId = InstanceId(2);
pub const TICK_MS: u64 = 16;

const MAX_STEPS: usize = 50_000;

pub struct Harness {
    pub controller: TransferController,
    pub source: Shared,
    pub destination: Shared,
    pub destination_channel: Rc<RefCell<LoopbackChannel<MemoryWorld>>>,
    pub now: u64,
}

impl Harness {
    pub fn new(
        source_world: MemoryWorld,
        transfer: TransferConfig,
        controller: ControllerConfig,
    ) -> Self {
        let source = Rc::new(RefCell::new(Instance::new(SOURCE, source_world, transfer.clone())));
        let destination =
            Rc::new(RefCell::new(Instance::new(DESTINATION, MemoryWorld::new(), transfer)));
        let destination_channel = Rc::new(RefCell::new(LoopbackChannel::new(destination.clone())));
        let mut controller = TransferController::new(controller).unwrap();
        controller.register(Box::new(LoopbackChannel::new(source.clone())));
        controller.register(Box::new(SharedChannel(destination_channel.clone())));
        Self {
            controller,
            source,
            destination,
            destination_channel,
            now: 0,
        }
    }

    pub fn with_defaults(source_world: MemoryWorld) -> Self {
        Self::new(source_world, TransferConfig::default(), ControllerConfig::default())
    }

    pub fn start(&mut self, platform: &str) -> TransferId {
        self.controller
            .start_transfer(platform, SOURCE, DESTINATION, self.now)
            .unwrap()
    }

    pub fn state(&self, id: TransferId) -> TransferState {
        self.controller.transfer(id).unwrap().state
    }

    fn tick(instance: &Shared) {
        let mut instance = instance.borrow_mut();
        instance.world_mut().advance(1);
        instance.on_tick();
    }

    /// Tick the source (and optionally the destination), then poll.
    pub fn step(&mut self, tick_destination: bool) {
        Self::tick(&self.source);
        if tick_destination {
            Self::tick(&self.destination);
        }
        self.now += TICK_MS;
        self.controller.poll(self.now);
    }

    pub fn run(&mut self, id: TransferId) -> TransferState {
        self.run_with(id, |_| {})
    }

    /// Run to a terminal state, calling `hook` on the destination after
    /// each of its ticks.
    pub fn run_with(
        &mut self,
        id: TransferId,
        mut hook: impl FnMut(&mut Instance<MemoryWorld>),
    ) -> TransferState {
        for _ in 0..MAX_STEPS {
            let state = self.state(id);
            if state.is_terminal() {
                return state;
            }
            Self::tick(&self.source);
            Self::tick(&self.destination);
            hook(&mut self.destination.borrow_mut());
            self.now += TICK_MS;
            self.controller.poll(self.now);
        }
        panic!("transfer {id} never settled");
    }

    pub fn run_until(&mut self, id: TransferId, wanted: TransferState, tick_destination: bool) {
        for _ in 0..MAX_STEPS {
            if self.state(id) == wanted {
                return;
            }
            assert!(!self.state(id).is_terminal(), "ended in {} before {wanted}", self.state(id));
            self.step(tick_destination);
        }
        panic!("transfer {id} never reached {wanted}");
    }
}

/// Live totals of a platform, or `None` if it does not exist.
pub fn totals(instance: &Shared, platform: &str) -> Option<VerificationTotals> {
    let instance = instance.borrow();
    let world = instance.world();
    world.platform(platform).map(|info| live_totals(world, info.surface))
}
