//! DigitalOcean implementation of the [`CloudClient`] trait.
//!
//! Talks to the droplets REST API directly with a bearer token. Every call
//! carries the configured timeout and none are retried here.

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::{BackendFuture, CloudClient, Instance, InstanceId, InstanceSpec, ProviderError};
use crate::config::{ConfigError, DigitalOceanConfig};

mod types;

use types::{CreateDropletRequest, DropletAction, DropletEnvelope, DropletList, ErrorBody};

const PAGE_SIZE: u32 = 200;
const MAX_PAGES: usize = 50;

/// Cloud client backed by the DigitalOcean droplets API.
#[derive(Clone, Debug)]
pub struct DigitalOceanClient {
    config: DigitalOceanConfig,
    http: reqwest::Client,
    api_base: String,
}

impl DigitalOceanClient {
    /// Validates configuration and builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails or the HTTP client
    /// cannot be constructed.
    pub fn new(config: DigitalOceanConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| ConfigError::Invalid(format!("failed to build HTTP client: {err}")))?;
        let api_base = config.api_base.trim_end_matches('/').to_owned();
        Ok(Self {
            config,
            http,
            api_base,
        })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &DigitalOceanConfig {
        &self.config
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.config.token)
            .timeout(self.config.request_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{path}", self.api_base)
    }

    async fn send(&self, action: &str, request: RequestBuilder) -> Result<Response, ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|err| transport_error(action, &err))?;
        debug!(action, status = %response.status(), "digitalocean response");
        if response.status().is_success() {
            return Ok(response);
        }
        Err(api_error(response).await)
    }

    async fn list(
        &self,
        action: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<Instance>, ProviderError> {
        let per_page = PAGE_SIZE.to_string();
        let first = self
            .request(Method::GET, &self.url("droplets"))
            .query(query)
            .query(&[("per_page", per_page.as_str())]);
        let mut page: DropletList = decode(self.send(action, first).await?).await?;
        let mut instances: Vec<Instance> = Vec::new();
        for _ in 0..MAX_PAGES {
            instances.extend(page.droplets.into_iter().map(Instance::from));
            let Some(next) = page.links.pages.next else {
                return Ok(instances);
            };
            let request = self.request(Method::GET, &next);
            page = decode(self.send(action, request).await?).await?;
        }
        Ok(instances)
    }
}

fn transport_error(action: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            action: action.to_owned(),
        }
    } else {
        ProviderError::Transport {
            message: err.to_string(),
        }
    }
}

async fn api_error(response: Response) -> ProviderError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let code = if body.id.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown")
            .to_ascii_lowercase()
            .replace(' ', "_")
    } else {
        body.id
    };
    let message = if body.message.is_empty() {
        text.trim().to_owned()
    } else {
        body.message
    };
    ProviderError::Api {
        status: status.as_u16(),
        code,
        message,
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProviderError::Transport {
            message: err.to_string(),
        })?;
    serde_json::from_slice(&bytes).map_err(|err| ProviderError::Decode {
        message: err.to_string(),
    })
}

impl CloudClient for DigitalOceanClient {
    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> BackendFuture<'a, InstanceId> {
        Box::pin(async move {
            let body = CreateDropletRequest {
                name: &spec.name,
                region: &self.config.region,
                size: &self.config.size,
                image: &self.config.image,
                ssh_keys: self.config.ssh_key_list(),
                tags: &spec.tags,
                user_data: &spec.boot_script,
                ipv6: false,
                monitoring: true,
            };
            let request = self
                .request(Method::POST, &self.url("droplets"))
                .json(&body);
            let envelope: DropletEnvelope = decode(self.send("create", request).await?).await?;
            Ok(InstanceId::new(envelope.droplet.id.to_string()))
        })
    }

    fn get<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, Option<Instance>> {
        Box::pin(async move {
            let request = self.request(Method::GET, &self.url(&format!("droplets/{id}")));
            match self.send("get", request).await {
                Ok(response) => {
                    let envelope: DropletEnvelope = decode(response).await?;
                    Ok(Some(Instance::from(envelope.droplet)))
                }
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn get_by_name<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<Instance>> {
        Box::pin(async move {
            let instances = self.list("get_by_name", &[("name", name)]).await?;
            Ok(instances.into_iter().find(|instance| instance.name == name))
        })
    }

    fn list_by_tag<'a>(&'a self, tag: &'a str) -> BackendFuture<'a, Vec<Instance>> {
        Box::pin(async move { self.list("list_by_tag", &[("tag_name", tag)]).await })
    }

    fn delete<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = self.request(Method::DELETE, &self.url(&format!("droplets/{id}")));
            match self.send("delete", request).await {
                Ok(_) => Ok(()),
                Err(err) if err.is_not_found() => {
                    debug!(instance_id = %id, "droplet already gone");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }

    fn reboot<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = self
                .request(Method::POST, &self.url(&format!("droplets/{id}/actions")))
                .json(&DropletAction { kind: "reboot" });
            self.send("reboot", request).await.map(|_| ())
        })
    }
}
