pub mod config;
pub mod downstream;
pub mod monitor;
pub mod plugins;
pub mod state;
pub mod upstream;
