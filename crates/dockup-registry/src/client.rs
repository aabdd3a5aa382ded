//! Tag listing against Docker Hub and GHCR.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::reference::{ImageRef, Registry};

/// Per-request timeout; one slow registry must not stall a whole check.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Safety cap on paginated listings.
const MAX_PAGES: usize = 10;

const GITHUB_PAGE_SIZE: usize = 100;

/// Anything that can list the published tags of an image.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>>;
}

/// Base URLs of the registries the client talks to.
#[derive(Debug, Clone)]
pub struct RegistryEndpoints {
    pub docker_hub: String,
    pub github_api: String,
    pub ghcr: String,
}

impl Default for RegistryEndpoints {
    fn default() -> Self {
        Self {
            docker_hub: "https://hub.docker.com".to_string(),
            github_api: "https://api.github.com".to_string(),
            ghcr: "https://ghcr.io".to_string(),
        }
    }
}

/// HTTP client for the tag-listing APIs.
pub struct RegistryClient {
    client: reqwest::Client,
    endpoints: RegistryEndpoints,
    /// Raises the GitHub API rate limit; optional.
    github_token: Option<String>,
}

impl RegistryClient {
    pub fn new(github_token: Option<String>) -> RegistryResult<Self> {
        Self::with_endpoints(RegistryEndpoints::default(), github_token)
    }

    pub fn with_endpoints(
        endpoints: RegistryEndpoints,
        github_token: Option<String>,
    ) -> RegistryResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dockup/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoints,
            github_token: github_token.filter(|t| !t.is_empty()),
        })
    }

    /// `GET /v2/repositories/{ns}/{repo}/tags`, following `next` links.
    async fn list_docker_hub(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        let mut tags = Vec::new();
        let mut next = Some(format!(
            "{}/v2/repositories/{}/tags?page_size=100",
            self.endpoints.docker_hub,
            image.path()
        ));
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == MAX_PAGES {
                warn!(image = %image, "docker hub listing truncated at page cap");
                break;
            }
            pages += 1;
            debug!("Listing tags from: {}", url);

            let response = check_status(self.client.get(&url).send().await?, &url)?;
            let page: HubPage = response.json().await?;
            tags.extend(page.results.into_iter().map(|t| t.name));
            next = page.next.filter(|n| !n.is_empty());
        }
        Ok(tags)
    }

    /// Package API first; registry v2 when GitHub refuses or throttles us.
    async fn list_ghcr(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        let tags = match self.list_package_tags(image).await {
            Ok(tags) => tags,
            Err(e @ (RegistryError::Unauthorized(_) | RegistryError::RateLimited(_))) => {
                debug!(image = %image, error = %e, "package API unavailable, using registry v2");
                self.list_registry_v2(image).await?
            }
            Err(e) => return Err(e),
        };
        // Signature and attestation artifacts are published as `sha256-…` tags.
        Ok(tags.into_iter().filter(|t| !t.starts_with("sha")).collect())
    }

    async fn list_package_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        match self.list_package_versions(image, "orgs").await {
            // The owner is a user account, not an organization.
            Err(RegistryError::Status { status: 404, .. }) => {
                self.list_package_versions(image, "users").await
            }
            other => other,
        }
    }

    async fn list_package_versions(
        &self,
        image: &ImageRef,
        owner_kind: &str,
    ) -> RegistryResult<Vec<String>> {
        let mut tags = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}/{}/{}/packages/container/{}/versions?per_page={}&page={}",
                self.endpoints.github_api,
                owner_kind,
                image.namespace,
                image.repository,
                GITHUB_PAGE_SIZE,
                page
            );
            debug!("Listing package versions from: {}", url);

            let mut request = self
                .client
                .get(&url)
                .header(ACCEPT, "application/vnd.github+json");
            if let Some(token) = &self.github_token {
                request = request.bearer_auth(token);
            }
            let response = check_status(request.send().await?, &url)?;
            let versions: Vec<PackageVersion> = response.json().await?;
            let count = versions.len();
            tags.extend(
                versions
                    .into_iter()
                    .flat_map(|v| v.metadata.container.tags),
            );
            if count < GITHUB_PAGE_SIZE {
                break;
            }
        }
        Ok(tags)
    }

    /// Anonymous pull token, then `GET /v2/{path}/tags/list` following `Link`.
    async fn list_registry_v2(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        let token = self.registry_token(image).await?;
        let mut tags = Vec::new();
        let mut next = Some(format!(
            "{}/v2/{}/tags/list?n=1000",
            self.endpoints.ghcr,
            image.path()
        ));
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == MAX_PAGES {
                warn!(image = %image, "registry v2 listing truncated at page cap");
                break;
            }
            pages += 1;
            debug!("Listing tags from: {}", url);

            let response = self.client.get(&url).bearer_auth(&token).send().await?;
            let response = check_status(response, &url)?;
            next = response
                .headers()
                .get("link")
                .and_then(|h| h.to_str().ok())
                .and_then(|link| parse_link_header(link, &self.endpoints.ghcr));
            let page: TagsResponse = response.json().await?;
            tags.extend(page.tags);
        }
        Ok(tags)
    }

    async fn registry_token(&self, image: &ImageRef) -> RegistryResult<String> {
        let url = format!(
            "{}/token?scope=repository:{}:pull",
            self.endpoints.ghcr,
            image.path()
        );
        debug!("Requesting registry token from: {}", url);
        let response = check_status(self.client.get(&url).send().await?, &url)?;
        let token: TokenResponse = response.json().await?;
        Ok(token.token)
    }
}

#[async_trait]
impl TagSource for RegistryClient {
    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        let raw = match image.registry {
            Registry::DockerHub => self.list_docker_hub(image).await?,
            Registry::Ghcr => self.list_ghcr(image).await?,
        };
        let mut seen = HashSet::new();
        let tags: Vec<String> = raw.into_iter().filter(|t| seen.insert(t.clone())).collect();
        trace!("Found {} tags total for {}", tags.len(), image);
        Ok(tags)
    }
}

/// Map non-success statuses onto the registry error taxonomy.
fn check_status(response: reqwest::Response, url: &str) -> RegistryResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|h| h.to_str().ok())
        == Some("0");
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited(url.to_string()),
        StatusCode::FORBIDDEN if exhausted => RegistryError::RateLimited(url.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RegistryError::Unauthorized(url.to_string())
        }
        _ => RegistryError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        },
    })
}

/// Extract the `rel="next"` target of a `Link` header.
fn parse_link_header(link: &str, base: &str) -> Option<String> {
    for part in link.split(',') {
        let part = part.trim();
        if !part.contains("rel=\"next\"") {
            continue;
        }
        let start = part.find('<')?;
        let len = part[start + 1..].find('>')?;
        let url = &part[start + 1..start + 1 + len];
        if url.starts_with('/') {
            return Some(format!("{}{}", base.trim_end_matches('/'), url));
        }
        return Some(url.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct HubPage {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<HubTag>,
}

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PackageVersion {
    #[serde(default)]
    metadata: PackageMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct PackageMetadata {
    #[serde(default)]
    container: ContainerMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, token: Option<&str>) -> RegistryClient {
        let endpoints = RegistryEndpoints {
            docker_hub: server.uri(),
            github_api: server.uri(),
            ghcr: server.uri(),
        };
        RegistryClient::with_endpoints(endpoints, token.map(String::from)).unwrap()
    }

    fn ghcr(org: &str, repo: &str) -> ImageRef {
        ImageRef::parse(&format!("ghcr.io/{org}/{repo}")).unwrap()
    }

    #[tokio::test]
    async fn docker_hub_follows_next_links() {
        let server = MockServer::start().await;
        let second = format!("{}/v2/repositories/library/nginx/tags?page=2", server.uri());

        Mock::given(method("GET"))
            .and(path("/v2/repositories/library/nginx/tags"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": null,
                "results": [{"name": "1.24"}, {"name": "1.25"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/repositories/library/nginx/tags"))
            .and(query_param("page_size", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": second,
                "results": [{"name": "1.26"}, {"name": "1.25"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let tags = client
            .list_tags(&ImageRef::parse("nginx").unwrap())
            .await
            .unwrap();
        assert_eq!(tags, vec!["1.26", "1.25", "1.24"]);
    }

    #[tokio::test]
    async fn docker_hub_listing_stops_at_page_cap() {
        let server = MockServer::start().await;
        let looping = format!(
            "{}/v2/repositories/library/redis/tags?page_size=100",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/v2/repositories/library/redis/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": looping,
                "results": [{"name": "7.2"}]
            })))
            .expect(MAX_PAGES as u64)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let tags = client
            .list_tags(&ImageRef::parse("redis").unwrap())
            .await
            .unwrap();
        assert_eq!(tags, vec!["7.2"]);
    }

    #[tokio::test]
    async fn docker_hub_rate_limit_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client
            .list_tags(&ImageRef::parse("org/app").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RateLimited(_)));
    }

    #[tokio::test]
    async fn ghcr_package_api_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/immich-app/packages/container/immich-server/versions"))
            .and(header("authorization", "Bearer ghp_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"metadata": {"container": {"tags": ["v1.100.0", "release"]}}},
                {"metadata": {"container": {"tags": ["sha256-abc.sig"]}}},
                {"metadata": {"container": {"tags": []}}}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("ghp_test"));
        let tags = client
            .list_tags(&ghcr("immich-app", "immich-server"))
            .await
            .unwrap();
        assert_eq!(tags, vec!["v1.100.0", "release"]);
    }

    #[tokio::test]
    async fn ghcr_user_owner_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/someone/packages/container/tool/versions"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/someone/packages/container/tool/versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"metadata": {"container": {"tags": ["2.0.1"]}}}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let tags = client.list_tags(&ghcr("someone", "tool")).await.unwrap();
        assert_eq!(tags, vec!["2.0.1"]);
    }

    #[tokio::test]
    async fn ghcr_falls_back_to_registry_v2_on_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/gethomepage/packages/container/homepage/versions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("scope", "repository:gethomepage/homepage:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "anon"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/gethomepage/homepage/tags/list"))
            .and(query_param("last", "v0.9.0"))
            .and(header("authorization", "Bearer anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "gethomepage/homepage",
                "tags": ["v0.9.1", "sha256-deadbeef"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/gethomepage/homepage/tags/list"))
            .and(query_param("n", "1000"))
            .and(header("authorization", "Bearer anon"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "link",
                        "</v2/gethomepage/homepage/tags/list?last=v0.9.0>; rel=\"next\"",
                    )
                    .set_body_json(json!({
                        "name": "gethomepage/homepage",
                        "tags": ["v0.8.0", "v0.9.0"]
                    })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let tags = client
            .list_tags(&ghcr("gethomepage", "homepage"))
            .await
            .unwrap();
        assert_eq!(tags, vec!["v0.8.0", "v0.9.0", "v0.9.1"]);
    }

    #[tokio::test]
    async fn ghcr_server_error_is_not_masked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.list_tags(&ghcr("org", "app")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Status { status: 500, .. }));
    }

    #[test]
    fn link_header_parsing() {
        assert_eq!(
            parse_link_header("</v2/a/b/tags/list?last=x>; rel=\"next\"", "https://ghcr.io"),
            Some("https://ghcr.io/v2/a/b/tags/list?last=x".to_string())
        );
        assert_eq!(parse_link_header("<https://x/y>; rel=\"prev\"", "https://ghcr.io"), None);
        assert_eq!(parse_link_header(">x<; rel=\"next\"", "https://ghcr.io"), None);
    }
}
