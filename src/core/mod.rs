pub mod history;
pub mod interruption;
pub mod playback;
pub mod realtime;
pub mod session;
pub mod tools;
pub mod turn_detect;

// Re-export commonly used types for convenience
pub use history::{ConversationItem, HistoryStore, ItemContent, ItemKind, ItemRole};
pub use interruption::InterruptionCoordinator;
pub use playback::PlaybackTracker;
pub use realtime::{BoxedTransport, OpenAIRealtimeTransport, RealtimeTransport, TransportError};
pub use session::{
    InboundEvent, OutboundCommand, SessionConfig, SessionError, SessionFault, SessionHandle,
    SessionNotification, SessionOutput, SessionState, SessionStateMachine, spawn_session,
};
pub use tools::{
    ApprovalPolicy, FnTool, HttpTool, ToolDefinition, ToolError, ToolHandler, ToolRegistry,
};
pub use turn_detect::{TurnDetectionPolicy, TurnDetector, VadSource};
