//! The Stream Engine (spec.md §4.5): conversation sanitization, envelope
//! construction, request issuance, binary event-stream framing, event
//! dispatch, and outcome reporting.

pub mod engine;
pub mod envelope;
pub mod events;
pub mod framing;
pub mod sanitize;
pub mod tool_assembly;

pub use engine::{StreamEngine, StreamOutcome};
pub use events::{StreamEvent, ToolUseCall};
pub use sanitize::{sanitize, ImageBlock, Message, Role, ToolResult, ToolResultStatus, ToolSpec, ToolUse};
