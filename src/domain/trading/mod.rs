pub mod agent;
pub mod order;
pub mod position;

pub use agent::{Agent, AgentMode, NewAgent};
pub use order::OrderResult;
pub use position::{AgentPosition, CloseReason, NewPosition, PositionStatus, Side};
