//! Takopi runner library.
//!
//! Everything between a chat transport and the agent CLIs:
//! - `pump`: rate-limited, priority-ordered, coalescing request delivery
//! - `subprocess`: agent process lifecycles (spawn, stream, teardown)
//! - `dispatch`: ordered single-consumer event delivery
//! - `locks`: per-conversation mutual exclusion
//! - `runner`: the per-agent run orchestration façade
//! - `progress`: debounced progress publishing through the pump

pub mod dispatch;
pub mod locks;
pub mod progress;
pub mod pump;
pub mod runner;
pub mod subprocess;

pub use dispatch::EventDispatcher;
pub use locks::{SessionGuard, SessionLockRegistry};
pub use progress::{ProgressPublisher, ProgressSink};
pub use pump::{Priority, PumpError, PumpRequest, RateLimiter, RequestPump};
pub use runner::{ClaudeEngine, CodexEngine, Engine, PiEngine, RunHandle, Runner, RunnerError};
pub use subprocess::{AgentProcess, SpawnSpec, SubprocessError};
