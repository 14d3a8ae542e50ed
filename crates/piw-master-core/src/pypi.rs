//! The upstream package-index boundary PackageScraper polls.

use async_trait::async_trait;
use serde::Deserialize;

/// The subset of the PyPI "simple"/JSON API the scraper needs.
#[async_trait]
pub trait PypiIndex: Send + Sync {
    /// The full list of package names known to the upstream index.
    async fn list_packages(&self) -> anyhow::Result<Vec<String>>;

    /// The list of released version strings for `package`.
    async fn package_releases(&self, package: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct SimpleIndexResponse {
    projects: Vec<SimpleProject>,
}

#[derive(Debug, Deserialize)]
struct SimpleProject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PackageJsonResponse {
    releases: std::collections::BTreeMap<String, serde_json::Value>,
}

/// A [`PypiIndex`] backed by `reqwest`, talking to a real PyPI-compatible
/// JSON API rooted at `root` (e.g. `https://pypi.org/pypi`).
pub struct ReqwestPypiIndex {
    http: reqwest::Client,
    root: reqwest::Url,
}

impl ReqwestPypiIndex {
    /// Build a client rooted at `root`.
    pub fn new(root: reqwest::Url) -> Self {
        ReqwestPypiIndex {
            http: reqwest::Client::new(),
            root,
        }
    }
}

#[async_trait]
impl PypiIndex for ReqwestPypiIndex {
    async fn list_packages(&self) -> anyhow::Result<Vec<String>> {
        let url = self.root.join("simple/")?;
        let res = self
            .http
            .get(url)
            .header("Accept", "application/vnd.pypi.simple.v1+json")
            .send()
            .await?;
        if !res.status().is_success() {
            anyhow::bail!("pypi simple index returned http {}", res.status());
        }
        let body: SimpleIndexResponse = res.json().await?;
        Ok(body.projects.into_iter().map(|p| p.name).collect())
    }

    async fn package_releases(&self, package: &str) -> anyhow::Result<Vec<String>> {
        let url = self.root.join(&format!("{package}/json"))?;
        let res = self.http.get(url).send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !res.status().is_success() {
            anyhow::bail!("pypi package json returned http {}", res.status());
        }
        let body: PackageJsonResponse = res.json().await?;
        Ok(body.releases.into_keys().collect())
    }
}
