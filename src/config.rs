use std::{env, net::SocketAddr};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub db: DbSettings,
}

/// Relational connection settings captured once at startup.
///
/// Host, database name, and user are all required before the stores will use
/// Postgres; anything less selects in-memory mode.
#[derive(Debug, Clone, Default)]
pub struct DbSettings {
    pub host: Option<String>,
    pub port: u16,
    pub dbname: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("INSIGHT_CATALOG_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        Ok(Self {
            bind_addr,
            db: DbSettings::from_env(),
        })
    }
}

impl DbSettings {
    pub fn from_env() -> Self {
        let host = non_empty_var("POSTGRES_HOST");
        let port = env::var("POSTGRES_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(5432);
        let dbname = non_empty_var("POSTGRES_DB");
        let user = non_empty_var("POSTGRES_USER");
        let password = non_empty_var("POSTGRES_PASSWORD");

        let tls_flag = env::var("POSTGRES_SSL")
            .ok()
            .map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);
        // Managed DigitalOcean clusters only accept TLS connections.
        let tls = tls_flag
            || host
                .as_deref()
                .map(|h| h.ends_with("ondigitalocean.com"))
                .unwrap_or(false);

        Self {
            host,
            port,
            dbname,
            user,
            password,
            tls,
        }
    }

    /// True iff every required connection parameter is present. Never opens a
    /// connection.
    pub fn configured(&self) -> bool {
        self.host.is_some() && self.dbname.is_some() && self.user.is_some()
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::DbSettings;

    #[test]
    fn configured_requires_host_db_and_user() {
        let mut settings = DbSettings {
            port: 5432,
            ..Default::default()
        };
        assert!(!settings.configured());

        settings.host = Some("localhost".into());
        settings.dbname = Some("insight".into());
        assert!(!settings.configured());

        settings.user = Some("app".into());
        assert!(settings.configured());
    }
}
