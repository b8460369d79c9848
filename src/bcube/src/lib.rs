pub mod aggregator;
pub mod communicator;
pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod strategy;
pub mod tensor;
pub mod topology;
pub mod transport;
pub mod utils;

pub use communicator::Communicator;
pub use error::Error;
