//! Actor-based rule execution
//!
//! Every rule instance is backed by one [`Actor`](actor::Actor) holding its
//! buffers, fault state and insight. Actors are plain state owned by the
//! [`ActorManager`](manager::ActorManager); the engine runtime drives them
//! from Tokio tasks communicating over channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!                  ┌──────────────────┐
//!   RawData ──────▶│   EngineHandle   │
//!                  └────────┬─────────┘
//!                           │ hash(connector)
//!            ┌──────────────┼──────────────┐
//!            │              │              │
//!    ┌───────▼──────┐       │      ┌───────▼──────┐
//!    │ Partition 0  │      ...     │ Partition N  │
//!    └───────┬──────┘              └───────┬──────┘
//!            └──────────────┬──────────────┘
//!                           │ ingest
//!                  ┌────────▼─────────┐        ┌─────────────────┐
//!                  │   ActorManager   │◀───────│ FlushScheduler  │
//!                  │ DashMap<Actor>   │ flush  └────────┬────────┘
//!                  └──────────────────┘                 │ batches
//!                                              ┌────────▼────────┐
//!                                              │ StorageBackend  │
//!                                              └─────────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Telemetry**: bounded mpsc channel per partition
//! 2. **Commands**: a second mpsc channel per task for control messages
//! 3. **Request/Response**: oneshot channels for sync and flush results

pub mod actor;
pub mod cancel;
pub mod engine;
pub mod hysteresis;
pub mod manager;
pub mod messages;

pub use actor::{Actor, ActorSettings, ActorState, EvaluationOutcome, IngestOutcome, OutputValues};
pub use cancel::{CancellationToken, FlushCancellation};
pub use engine::EngineHandle;
pub use hysteresis::{FaultTransition, HysteresisDetector};
pub use manager::{ActorManager, RegistrationReport};
pub use messages::{FlushReport, RawData, WorkerStats};
