pub mod commands;
pub mod device;
pub mod error;
pub mod fence;
pub mod handles;
pub mod headless;
pub mod queue;
pub mod resource_state;
pub mod resources;
