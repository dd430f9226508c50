pub mod asset_hub;
pub mod asset_loader;
pub mod handle;
pub mod pak;
pub mod staging;
pub mod upload;
