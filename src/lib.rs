pub mod admission;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod events;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod router;
pub mod transport;
