pub mod clock;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod exchange;
pub mod node;
pub mod servo;
pub mod sim;
pub mod telemetry;
pub mod topology;
