// tado-local-api: gateway transport capability, HAP relay client and Tado cloud client

pub mod cloud;
pub mod error;
pub mod hap;
pub mod transport;

pub use error::Error;
