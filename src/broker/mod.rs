pub mod client;

pub use client::BrokerClient;
