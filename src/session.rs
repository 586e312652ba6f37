//! Bearer tokens for the metering backend and the network server
//!
//! Both tokens are obtained together and replaced together. The loop owns the
//! current [`Session`] and swaps in a fresh one from [`SessionManager::acquire`]
//! whenever either upstream answers 401.

use crate::config::{MeteringConfig, NetworkServerConfig};
use crate::error::AuthError;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

const METERING: &str = "metering backend";
const NETWORK_SERVER: &str = "network server";

/// Opaque bearer token; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub metering_token: BearerToken,
    pub network_token: BearerToken,
    pub issued_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct MeteringLogin<'a> {
    login: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeteringLoginResponse {
    access_token: Option<String>,
}

#[derive(Serialize)]
struct NetworkServerLogin<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct NetworkServerLoginResponse {
    jwt: Option<String>,
}

pub struct SessionManager {
    http: Client,
    metering: MeteringConfig,
    network_server: NetworkServerConfig,
}

impl SessionManager {
    pub fn new(http: Client, metering: MeteringConfig, network_server: NetworkServerConfig) -> Self {
        Self {
            http,
            metering,
            network_server,
        }
    }

    /// Log in to both services; both tokens or an error, never one of them
    pub async fn acquire(&self) -> Result<Session, AuthError> {
        info!("Refreshing access tokens...");

        let network_token = self.login_network_server().await?;
        let metering_token = self.login_metering().await?;

        debug!("Both access tokens refreshed");
        Ok(Session {
            metering_token,
            network_token,
            issued_at: Utc::now(),
        })
    }

    async fn login_metering(&self) -> Result<BearerToken, AuthError> {
        let url = format!("{}/account/login", self.metering.base_url);
        let body = MeteringLogin {
            login: &self.metering.login,
            password: &self.metering.password,
        };

        let resp: MeteringLoginResponse = post_login(&self.http, &url, &body, METERING).await?;
        non_empty(resp.access_token, METERING, "accessToken")
    }

    async fn login_network_server(&self) -> Result<BearerToken, AuthError> {
        let url = format!("{}/internal/login", self.network_server.base_url);
        let body = NetworkServerLogin {
            email: &self.network_server.email,
            password: &self.network_server.password,
        };

        let resp: NetworkServerLoginResponse =
            post_login(&self.http, &url, &body, NETWORK_SERVER).await?;
        non_empty(resp.jwt, NETWORK_SERVER, "jwt")
    }
}

async fn post_login<B, R>(
    http: &Client,
    url: &str,
    body: &B,
    service: &'static str,
) -> Result<R, AuthError>
where
    B: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let resp = http
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|source| AuthError::Transport { service, source })?;

    let status = resp.status();
    if !status.is_success() {
        return Err(AuthError::Rejected { service, status });
    }

    resp.json()
        .await
        .map_err(|source| AuthError::Transport { service, source })
}

fn non_empty(
    token: Option<String>,
    service: &'static str,
    field: &'static str,
) -> Result<BearerToken, AuthError> {
    match token {
        Some(token) if !token.is_empty() => Ok(BearerToken::new(token)),
        _ => Err(AuthError::MissingToken { service, field }),
    }
}
