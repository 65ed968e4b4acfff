mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{ProtocolSettings, ServerSettings, Settings, StorageSettings};

/// Loads `config/default` (any format the `config` crate knows, optional) and
/// `MQTT__SECTION__KEY` environment variables, then fills what is missing
/// from [`Settings::default`].
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("MQTT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let server = partial.server;
    let protocol = partial.protocol;
    let storage = partial.storage;

    let settings = Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        protocol: ProtocolSettings {
            maximum_qos: protocol
                .as_ref()
                .and_then(|p| p.maximum_qos)
                .unwrap_or(default.protocol.maximum_qos),
            keep_alive_secs: protocol
                .as_ref()
                .and_then(|p| p.keep_alive_secs)
                .unwrap_or(default.protocol.keep_alive_secs),
            wait_timeout_secs: protocol
                .as_ref()
                .and_then(|p| p.wait_timeout_secs)
                .unwrap_or(default.protocol.wait_timeout_secs),
            connection_timeout_secs: protocol
                .as_ref()
                .and_then(|p| p.connection_timeout_secs)
                .unwrap_or(default.protocol.connection_timeout_secs),
            client_id_max_length: protocol
                .as_ref()
                .and_then(|p| p.client_id_max_length)
                .unwrap_or(default.protocol.client_id_max_length),
            allow_wildcards_in_topic_filters: protocol
                .as_ref()
                .and_then(|p| p.allow_wildcards_in_topic_filters)
                .unwrap_or(default.protocol.allow_wildcards_in_topic_filters),
        },
        storage: StorageSettings {
            path: storage.and_then(|s| s.path).or(default.storage.path),
        },
    };
    settings.protocol.validate()?;
    Ok(settings)
}
