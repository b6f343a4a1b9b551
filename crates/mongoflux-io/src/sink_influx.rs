//! InfluxDB sink writer.
//!
//! One `InfluxWriter` owns one HTTP client and is shared by every worker;
//! reqwest clients are safe for concurrent writes and pool connections
//! internally. Databases are created on demand through `/query` when
//! auto-create is enabled; batches go to `/write` as line protocol.

use anyhow::{bail, Context, Result};
use reqwest::{Certificate, RequestBuilder, Response};
use tracing::debug;

use mongoflux_core::InfluxSettings;

use crate::batch::LineBatch;

pub struct InfluxWriter {
    http: reqwest::Client,
    settings: InfluxSettings,
}

impl InfluxWriter {
    pub fn new(settings: InfluxSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if settings.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem_file) = &settings.pem_file {
            let pem = std::fs::read(pem_file)
                .with_context(|| format!("reading CA file {}", pem_file.display()))?;
            builder = builder.add_root_certificate(
                Certificate::from_pem(&pem)
                    .with_context(|| format!("parsing CA file {}", pem_file.display()))?,
            );
        }
        Ok(Self {
            http: builder.build().context("building influx HTTP client")?,
            settings,
        })
    }

    /// Create a database if it does not exist. A no-op when auto-create is
    /// disabled; the server treats repeated creates as idempotent.
    pub async fn ensure_database(&self, database: &str) -> Result<()> {
        if !self.settings.auto_create_db {
            return Ok(());
        }
        debug!(database, "ensuring influx database exists");
        let statement = format!("CREATE DATABASE \"{}\"", database.replace('"', "\\\""));
        let request = self
            .http
            .post(format!("{}/query", self.settings.url))
            .query(&[("q", statement.as_str())]);
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("creating influx database {database}"))?;
        check(response).await
    }

    /// Write one batch. Blocking from the worker's point of view; the batch
    /// is gone from memory either way once this returns.
    pub async fn write(&self, batch: &LineBatch) -> Result<()> {
        let mut query: Vec<(&str, &str)> = vec![
            ("db", batch.database.as_str()),
            ("precision", batch.precision.as_str()),
        ];
        if let Some(rp) = &batch.retention {
            query.push(("rp", rp.as_str()));
        }
        let request = self
            .http
            .post(format!("{}/write", self.settings.url))
            .query(&query)
            .body(batch.encode());
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("writing batch to influx database {}", batch.database))?;
        check(response).await
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.settings.user {
            Some(user) => request.basic_auth(user, self.settings.password.as_deref()),
            None => request,
        }
    }
}

async fn check(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    // Influx reports failures as {"error": "..."}.
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(body);
    bail!("influx returned {status}: {message}");
}
