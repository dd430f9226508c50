pub mod cancellation;
pub mod config;
pub mod engine;
pub mod events;
pub mod fixed_timestep;
pub mod frame_context;
pub mod frame_state;
pub mod graphics_layer;
pub mod inbox;
pub mod module;
pub mod phase;
pub mod type_registry;
