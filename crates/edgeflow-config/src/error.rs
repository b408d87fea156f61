use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("device configuration file {path} is empty")]
    Empty { path: String },

    #[error("invalid device configuration in {path}: missing {}", missing.join(", "))]
    Invalid { path: String, missing: Vec<String> },
}
