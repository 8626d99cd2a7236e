use serde::Serialize;
use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

const MODES: &[&str] = &["client", "peer", "router"];

fn insert(target: &mut zenoh::Config, key: &str, value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string(value)?;
    target
        .insert_json5(key, &json)
        .map_err(|e| Error::ZenohConfig(format!("{}: {}", key, e)))
}

/// Build a Zenoh configuration from the bridge's [`ZenohConfig`].
///
/// Empty endpoint lists keep Zenoh's defaults; a username enables
/// user/password transport authentication.
pub fn build_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    if !MODES.contains(&config.mode.as_str()) {
        return Err(Error::ZenohConfig(format!(
            "unknown mode '{}', expected one of {:?}",
            config.mode, MODES
        )));
    }

    let mut zenoh_config = zenoh::Config::default();
    insert(&mut zenoh_config, "mode", &config.mode)?;

    if !config.connect.is_empty() {
        insert(&mut zenoh_config, "connect/endpoints", &config.connect)?;
    }
    if !config.listen.is_empty() {
        insert(&mut zenoh_config, "listen/endpoints", &config.listen)?;
    }

    if let Some(user) = &config.username {
        insert(&mut zenoh_config, "transport/auth/usrpwd/user", user)?;
        insert(
            &mut zenoh_config,
            "transport/auth/usrpwd/password",
            &config.password.as_deref().unwrap_or_default(),
        )?;
    }

    Ok(zenoh_config)
}

/// Open the telemetry session.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let zenoh_config = build_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        authenticated = config.username.is_some(),
        "Opening Zenoh session"
    );

    let session = zenoh::open(zenoh_config).await?;
    tracing::info!(zid = %session.zid(), "Zenoh session open");

    Ok(session)
}
