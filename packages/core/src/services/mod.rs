//! Services
//!
//! - `BridgeService` - binds, announces and runs one bridge process

pub mod bridge_service;

pub use bridge_service::BridgeService;
