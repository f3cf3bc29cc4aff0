use crate::config::ReleaseSource;
use crate::job_id::{JobDirectory, JobLookupError, WorkflowJob};
use crate::release::{DownloadLocator, IndexError, Release, ReleaseIndex};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde::Deserialize;
use std::io::Write;
use std::time::Duration;
use tracing::debug;

const USER_AGENT_VALUE: &str = concat!("orbit-sidecar/", env!("CARGO_PKG_VERSION"));
const JSON_ACCEPT: &str = "application/vnd.github+json";
const OCTET_STREAM: &str = "application/octet-stream";

pub struct GithubClient {
    api_base: String,
    owner: String,
    repo: String,
    token: String,
    client: Client,
    no_redirect: Client,
}

#[derive(Debug, Deserialize)]
struct JobsPayload {
    #[serde(default)]
    jobs: Vec<WorkflowJob>,
}

impl GithubClient {
    pub fn new(source: &ReleaseSource, token: &str) -> Result<Self, IndexError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        let no_redirect = Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            api_base: source.api_base.trim_end_matches('/').to_string(),
            owner: source.owner.clone(),
            repo: source.repo.clone(),
            token: token.to_string(),
            client,
            no_redirect,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_base, self.owner, self.repo, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(USER_AGENT, USER_AGENT_VALUE);
        if self.token.is_empty() {
            request
        } else {
            request.header(AUTHORIZATION, format!("token {}", self.token))
        }
    }

    fn get_json(&self, url: &str) -> Result<Response, IndexError> {
        let response = self
            .authorized(self.client.get(url))
            .header(ACCEPT, JSON_ACCEPT)
            .send()?;
        Ok(response)
    }
}

fn status_error(url: &str, response: Response) -> IndexError {
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    IndexError::Status {
        url: url.to_string(),
        status,
        body: body.trim().to_string(),
    }
}

impl ReleaseIndex for GithubClient {
    fn latest_release(&self) -> Result<Release, IndexError> {
        let url = self.repo_url("/releases/latest");
        debug!("fetching latest release from {url}");
        let response = self.get_json(&url)?;
        if !response.status().is_success() {
            return Err(status_error(&url, response));
        }
        Ok(response.json()?)
    }

    fn release_by_tag(&self, tag: &str) -> Result<Option<Release>, IndexError> {
        let url = self.repo_url(&format!("/releases/tags/{tag}"));
        debug!("fetching release {tag} from {url}");
        let response = self.get_json(&url)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(&url, response));
        }
        Ok(Some(response.json()?))
    }

    fn authorize_download(
        &self,
        asset_id: u64,
        asset_url: &str,
    ) -> Result<DownloadLocator, IndexError> {
        let url = if asset_url.is_empty() {
            self.repo_url(&format!("/releases/assets/{asset_id}"))
        } else {
            asset_url.to_string()
        };
        let response = self
            .authorized(self.no_redirect.get(&url))
            .header(ACCEPT, OCTET_STREAM)
            .send()?;
        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return match location {
                Some(location) => Ok(DownloadLocator {
                    url: location,
                    authorized: false,
                }),
                None => Err(IndexError::NoLocation { asset: url }),
            };
        }
        if status.is_success() {
            // Served inline; the bytes have to be re-requested with credentials.
            return Ok(DownloadLocator {
                url,
                authorized: true,
            });
        }
        Err(status_error(&url, response))
    }

    fn fetch(&self, locator: &DownloadLocator, dest: &mut dyn Write) -> Result<u64, IndexError> {
        let request = if locator.authorized {
            self.authorized(self.client.get(&locator.url))
        } else {
            self.client
                .get(&locator.url)
                .header(USER_AGENT, USER_AGENT_VALUE)
        };
        let mut response = request.header(ACCEPT, OCTET_STREAM).send()?;
        if !response.status().is_success() {
            return Err(status_error(&locator.url, response));
        }
        let written = response.copy_to(dest)?;
        dest.flush().map_err(|source| IndexError::Io {
            url: locator.url.clone(),
            source,
        })?;
        Ok(written)
    }
}

impl JobDirectory for GithubClient {
    fn list_jobs(&self, repository: &str, run_id: u64) -> Result<Vec<WorkflowJob>, JobLookupError> {
        let url = format!(
            "{}/repos/{}/actions/runs/{}/jobs?per_page=100",
            self.api_base, repository, run_id
        );
        let response = self.get_json(&url)?;
        if !response.status().is_success() {
            return Err(JobLookupError::Index(status_error(&url, response)));
        }
        let payload: JobsPayload = response.json().map_err(IndexError::from)?;
        Ok(payload.jobs)
    }
}
