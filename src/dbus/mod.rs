//! D-Bus integration for desktop services

use anyhow::{Context, Result};
use zbus::Connection;

pub mod portal;

/// Connect to the session D-Bus
pub async fn session() -> Result<Connection> {
    let conn = Connection::session()
        .await
        .context("Failed to connect to D-Bus session bus")?;

    tracing::info!("Connected to D-Bus session bus");
    Ok(conn)
}
