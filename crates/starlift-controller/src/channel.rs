//! The control channel between the orchestrator and a simulation process.
//!
//! A channel only executes a string instruction and returns a string. The
//! typed layer on top ([`call`]) serialises an [`Instruction`], parses the
//! [`Response`] and turns remote errors into [`ChannelError::Remote`].

use std::cell::RefCell;
use std::rc::Rc;

use starlift_core::id::InstanceId;
use starlift_core::instance::Instance;
use starlift_core::protocol::{Instruction, RemoteError, Response};
use starlift_core::world::World;

/// Largest instruction or response a loopback channel accepts by default.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// The instance could not be reached. Callers may retry.
    #[error("instance {0} unreachable")]
    Unreachable(InstanceId),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl ChannelError {
    /// Whether trying the same instruction again can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Unreachable(_))
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

pub trait ControlChannel {
    /// The instance at the far end.
    fn instance(&self) -> InstanceId;

    /// Execute one scripted instruction and return its result text.
    fn execute(&mut self, instruction: &str) -> Result<String, ChannelError>;
}

/// Send a typed instruction and parse the typed response.
pub fn call(
    channel: &mut dyn ControlChannel,
    instruction: &Instruction,
) -> Result<Response, ChannelError> {
    let text =
        serde_json::to_string(instruction).map_err(|e| ChannelError::Malformed(e.to_string()))?;
    let reply = channel.execute(&text)?;
    let response: Response =
        serde_json::from_str(&reply).map_err(|e| ChannelError::Malformed(e.to_string()))?;
    Ok(response.into_result()?)
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

/// In-process channel straight into an [`Instance`], with the same size
/// limit a real channel has and injectable outages for tests.
pub struct LoopbackChannel<W: World> {
    instance: Rc<RefCell<Instance<W>>>,
    max_message_bytes: usize,
    outage: u32,
}

impl<W: World> LoopbackChannel<W> {
    pub fn new(instance: Rc<RefCell<Instance<W>>>) -> Self {
        Self {
            instance,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            outage: 0,
        }
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    /// Fail the next `calls` executions as unreachable.
    pub fn fail_next(&mut self, calls: u32) {
        self.outage = calls;
    }

    fn check_size(&self, size: usize) -> Result<(), ChannelError> {
        if size > self.max_message_bytes {
            return Err(ChannelError::MessageTooLarge {
                size,
                limit: self.max_message_bytes,
            });
        }
        Ok(())
    }
}

impl<W: World> ControlChannel for LoopbackChannel<W> {
    fn instance(&self) -> InstanceId {
        self.instance.borrow().id()
    }

    fn execute(&mut self, instruction: &str) -> Result<String, ChannelError> {
        if self.outage > 0 {
            self.outage -= 1;
            return Err(ChannelError::Unreachable(self.instance()));
        }
        self.check_size(instruction.len())?;
        let reply = self.instance.borrow_mut().execute(instruction);
        self.check_size(reply.len())?;
        Ok(reply)
    }
}

/// Shared handle to a loopback channel, so a test can inject outages
/// after handing the channel to a controller.
pub struct SharedChannel<C: ControlChannel>(pub Rc<RefCell<C>>);

impl<C: ControlChannel> ControlChannel for SharedChannel<C> {
    fn instance(&self) -> InstanceId {
        self.0.borrow().instance()
    }

    fn execute(&mut self, instruction: &str) -> Result<String, ChannelError> {
        self.0.borrow_mut().execute(instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starlift_core::config::TransferConfig;
    use starlift_core::protocol::ErrorKind;
    use starlift_core::test_utils::*;

    fn loopback() -> LoopbackChannel<MemoryWorld> {
        let mut world = MemoryWorld::new();
        build_storage_platform(&mut world, "alpha", 2, 10);
        let instance = Instance::new(InstanceId(1), world, TransferConfig::default());
        LoopbackChannel::new(Rc::new(RefCell::new(instance)))
    }

    #[test]
    fn call_returns_typed_response() {
        let mut channel = loopback();
        assert_eq!(channel.instance(), InstanceId(1));
        let r = call(&mut channel, &Instruction::Lock {
            platform: "alpha".into(),
        })
        .unwrap();
        assert!(matches!(r, Response::Locked { .. }));
    }

    #[test]
    fn remote_errors_surface_as_errors() {
        let mut channel = loopback();
        let err = call(&mut channel, &Instruction::Unlock {
            platform: "alpha".into(),
        })
        .unwrap_err();
        assert!(matches!(err, ChannelError::Remote(RemoteError { kind: ErrorKind::Lock, .. })));
        assert!(!err.is_transient());
    }

    #[test]
    fn oversized_messages_rejected() {
        let mut channel = loopback().with_max_message_bytes(16);
        let err = call(&mut channel, &Instruction::Lock {
            platform: "alpha".into(),
        })
        .unwrap_err();
        assert!(matches!(err, ChannelError::MessageTooLarge { limit: 16, .. }));
    }

    #[test]
    fn outage_is_transient_and_ends() {
        let mut channel = loopback();
        channel.fail_next(2);
        for _ in 0..2 {
            let err = call(&mut channel, &Instruction::Status).unwrap_err();
            assert!(err.is_transient());
        }
        assert!(call(&mut channel, &Instruction::Status).is_ok());
    }
}
