pub mod commands;
pub mod frame;
pub mod gateway;
pub mod mqtt;
pub mod output;
pub mod payloads;
pub mod presets;
pub mod state;
