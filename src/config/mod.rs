pub mod settings;

pub use settings::EndpointConfig;
