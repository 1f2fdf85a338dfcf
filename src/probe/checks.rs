//! Readiness checks used by the provisioning workflow.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use super::PollResult;
use crate::backend::{CloudClient, Instance, InstanceId};
use crate::config::ConfigError;
use crate::session::{CommandRunner, SessionDriver, SessionTarget};

/// Future returned by [`ArtifactProbe::check`].
pub type ProbeFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ready once the provider reports the instance `active`.
pub async fn instance_active<C>(client: &C, id: &InstanceId) -> PollResult<Instance>
where
    C: CloudClient + ?Sized,
{
    match client.get(id).await {
        Ok(Some(instance)) if instance.is_active() => PollResult::Ready(instance),
        Ok(Some(instance)) => {
            PollResult::Pending(format!("instance status is {}", instance.status))
        }
        Ok(None) => PollResult::Pending(format!("instance {id} not visible yet")),
        Err(err) => PollResult::Pending(err.to_string()),
    }
}

/// Ready once a trial session runs `whoami` and prints the target user.
pub async fn shell_reachable<R>(driver: &SessionDriver<R>, target: &SessionTarget) -> PollResult<()>
where
    R: CommandRunner,
{
    let expected = target.user.clone();
    let outcome = driver
        .with_session(target, |mut session| async move {
            session.run("whoami").await
        })
        .await;
    match outcome {
        Ok(result) if result.is_success() && result.stdout.trim() == expected => {
            PollResult::Ready(())
        }
        Ok(result) => PollResult::Pending(format!(
            "whoami returned {:?} with status {:?}",
            result.stdout.trim(),
            result.exit_code
        )),
        Err(err) => PollResult::Pending(err.to_string()),
    }
}

/// Checks whether the bot application is serving its pairing artifact.
pub trait ArtifactProbe: Send + Sync {
    /// Probes the instance at `ip` once.
    fn check(&self, ip: Ipv4Addr) -> ProbeFuture<'_, PollResult<()>>;
}

/// URL of the pairing artifact on an instance.
#[must_use]
pub fn artifact_url(ip: Ipv4Addr, port: u16) -> String {
    format!("http://{ip}:{port}/")
}

/// Returns `true` for a 200 response carrying an `image/*` content type.
#[must_use]
pub fn is_image_response(status: StatusCode, content_type: Option<&str>) -> bool {
    status == StatusCode::OK
        && content_type.is_some_and(|value| value.trim().to_ascii_lowercase().starts_with("image/"))
}

/// Probes the pairing artifact over plain HTTP.
#[derive(Clone, Debug)]
pub struct HttpArtifactProbe {
    client: reqwest::Client,
    port: u16,
}

impl HttpArtifactProbe {
    /// Builds a probe for `port` whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the HTTP client cannot be
    /// constructed.
    pub fn new(port: u16, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConfigError::Invalid(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, port })
    }
}

impl ArtifactProbe for HttpArtifactProbe {
    fn check(&self, ip: Ipv4Addr) -> ProbeFuture<'_, PollResult<()>> {
        Box::pin(async move {
            let url = artifact_url(ip, self.port);
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(err) => return PollResult::Pending(format!("GET {url} failed: {err}")),
            };
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            if is_image_response(status, content_type.as_deref()) {
                PollResult::Ready(())
            } else {
                PollResult::Pending(format!(
                    "GET {url} returned {status} with content type {}",
                    content_type.as_deref().unwrap_or("<none>")
                ))
            }
        })
    }
}
