pub mod config;
pub mod controller;
pub mod device;
pub mod mqtt;
pub mod shutdown;
