pub mod background;
pub mod emit;
pub mod pipeline;
pub mod scenario;
pub mod session;
pub mod signals;

pub use emit::{ChannelSink, Emitter, EventSink};
pub use pipeline::{Orchestrator, TurnReport, AGENT_TIMEOUT, CRISIS_RESOURCES, FALLBACK_REPLY};
pub use scenario::{BreakthroughDef, Scenario, ScenarioListing, ScenarioSet};
pub use session::{Session, SessionRegistry};
