//! Agent turn state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions:
//! the runtime feeds events in, executes the returned effects, and feeds
//! the events those effects produce back in until the turn completes.

mod clarification;
mod effect;
pub mod event;
pub mod router;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, TurnKind};
pub use event::Event;
pub use router::{route, Route};
pub use state::{
    ConvContext, ConvState, ErrorKind, SourceMetadata, ToolCall, ToolInput, ToolResult,
};
pub use transition::{transition, TransitionError, TransitionResult};
