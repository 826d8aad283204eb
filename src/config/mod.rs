pub mod settings;

pub use settings::{ Config, ConfigError, FailurePolicy, ParseFailurePolicyError };
