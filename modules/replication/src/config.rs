use serde::Deserialize;

/// Models whose mutations are published to other services.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Enrolled model subjects, e.g. `space`
    pub models: Vec<String>,
}

