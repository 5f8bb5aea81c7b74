//! Protocol definitions for player/bankroller messaging.

mod envelope;
pub mod messages;
mod types;

pub use envelope::{Action, CorrelationId, Envelope, MessageKind};
pub use types::{
    ChannelDescriptor, ChannelState, ConnectionInfo, RoundArgs, RoundInput, RoundReport,
    RoundRequest,
};
