//! Domain model (ids, messages, batches, states, errors).

pub mod batch;
pub mod errors;
pub mod ids;
pub mod message;
pub mod state;

pub use self::batch::{BatchLimits, MessageBatch};
pub use self::errors::{BatchOverflowError, DeliveryError, HandlerError, PublishError};
pub use self::ids::{LeaseId, MessageId};
pub use self::message::{OutboundMessage, ReceivedMessage};
pub use self::state::{MessageState, ProcessorState, QueueCounts};
