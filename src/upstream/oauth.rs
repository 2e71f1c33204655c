use crate::bus::{EventBus, ProxyEvent};
use crate::config::OauthSpec;
use crate::store::{BUCKET_OAUTH_TOKENS, Store};
use anyhow::{Context, Result, anyhow};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope, TokenUrl,
    basic::BasicClient,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Hard deadline for one authorization round-trip (browser included).
const AUTHORIZE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthTokens {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(rename = "tokenUri")]
    pub token_uri: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Unix timestamp of expiry; `None` means unknown (treated as stale).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

impl OauthTokens {
    /// Valid and not inside the proactive-refresh window.
    pub fn is_fresh(&self, warn: Duration) -> bool {
        match self.expiry {
            Some(expiry) => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .is_ok_and(|now| now.as_secs() + warn.as_secs() < expiry),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

/// RFC 8414 metadata discovery against the upstream's origin, with the
/// OpenID well-known location as a fallback.
pub async fn discover_metadata(
    http: &reqwest::Client,
    server_url: &str,
) -> Result<AuthServerMetadata> {
    let base = url::Url::parse(server_url).context("upstream URL is not parseable")?;
    let origin = format!(
        "{}://{}",
        base.scheme(),
        base.host_str().map_or_else(String::new, |h| {
            base.port()
                .map_or_else(|| h.to_string(), |p| format!("{}:{}", h, p))
        })
    );

    for well_known in [
        "/.well-known/oauth-authorization-server",
        "/.well-known/openid-configuration",
    ] {
        let endpoint = format!("{}{}", origin, well_known);
        match http.get(&endpoint).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<AuthServerMetadata>().await {
                    Ok(metadata) => return Ok(metadata),
                    Err(e) => debug!("metadata at {} unparseable: {}", endpoint, e),
                }
            }
            Ok(response) => debug!("metadata probe {} -> {}", endpoint, response.status()),
            Err(e) => debug!("metadata probe {} failed: {}", endpoint, e),
        }
    }
    Err(anyhow!(
        "no authorization-server metadata found for {}",
        origin
    ))
}

/// RFC 7591 Dynamic Client Registration. Returns the issued client id.
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    redirect_uri: &str,
) -> Result<String> {
    let body = serde_json::json!({
        "client_name": "mcpproxy",
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });
    let response = http.post(registration_endpoint).json(&body).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "dynamic client registration failed ({}): {}",
            status,
            text
        ));
    }
    let registered: serde_json::Value = response.json().await?;
    registered["client_id"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("registration response missing client_id"))
}

/// Outcome type kept cloneable so joiners of an in-flight authorization can
/// all receive it.
pub type AuthOutcome = Result<OauthTokens, String>;

/// Per-server OAuth coordinator.
///
/// Guarantees at most one in-flight authorization per server: a second
/// request while one is pending awaits the pending outcome instead of
/// opening a second browser round-trip.
pub struct OauthFlow {
    server: String,
    store: Arc<Store>,
    bus: EventBus,
    http: reqwest::Client,
    expiry_warning: Duration,
    in_flight: Mutex<Option<watch::Receiver<Option<AuthOutcome>>>>,
}

impl OauthFlow {
    pub fn new(
        server: impl Into<String>,
        store: Arc<Store>,
        bus: EventBus,
        expiry_warning: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            store,
            bus,
            http: reqwest::Client::new(),
            expiry_warning,
            in_flight: Mutex::new(None),
        }
    }

    pub fn persisted(&self) -> Option<OauthTokens> {
        self.store
            .get_json(BUCKET_OAUTH_TOKENS, &self.server)
            .ok()
            .flatten()
    }

    pub fn forget(&self) {
        let _ = self.store.delete(BUCKET_OAUTH_TOKENS, &self.server);
    }

    fn persist(&self, tokens: &OauthTokens) {
        if let Err(e) = self.store.put_json(BUCKET_OAUTH_TOKENS, &self.server, tokens) {
            warn!("failed to persist OAuth tokens for {}: {}", self.server, e);
        }
    }

    /// Best usable token without user interaction: the persisted one when
    /// still outside the expiry-warning window, proactively refreshed when
    /// inside it. Never starts an interactive authorization.
    pub async fn fresh_tokens(&self) -> Option<OauthTokens> {
        let tokens = self.persisted()?;
        if tokens.is_fresh(self.expiry_warning) {
            return Some(tokens);
        }
        if tokens.refresh_token.is_some() {
            match self.refresh(tokens.clone()).await {
                Ok(refreshed) => return Some(refreshed),
                Err(e) => warn!("token refresh for {} failed: {}", self.server, e),
            }
        }
        // Stale but possibly still accepted; a 401 will trigger the full flow.
        Some(tokens)
    }

    /// Single-flight interactive authorization.
    pub async fn authorize(self: &Arc<Self>, spec: OauthSpec, server_url: String) -> AuthOutcome {
        let mut rx = {
            let mut guard = self.in_flight.lock().await;
            if let Some(rx) = guard.as_ref() {
                debug!("joining in-flight authorization for {}", self.server);
                rx.clone()
            } else {
                let (tx, rx) = watch::channel::<Option<AuthOutcome>>(None);
                *guard = Some(rx.clone());
                let this = self.clone();
                tokio::spawn(async move {
                    let outcome = match tokio::time::timeout(
                        AUTHORIZE_TIMEOUT,
                        this.run_authorization(&spec, &server_url),
                    )
                    .await
                    {
                        Ok(Ok(tokens)) => Ok(tokens),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("authorization timed out".to_string()),
                    };
                    match &outcome {
                        Ok(tokens) => {
                            this.persist(tokens);
                            this.bus.publish(ProxyEvent::OauthCompleted {
                                server_name: this.server.clone(),
                                success: true,
                                error: None,
                            });
                        }
                        Err(e) => {
                            this.bus.publish(ProxyEvent::OauthCompleted {
                                server_name: this.server.clone(),
                                success: false,
                                error: Some(e.clone()),
                            });
                        }
                    }
                    let _ = tx.send(Some(outcome));
                    *this.in_flight.lock().await = None;
                });
                rx
            }
        };

        loop {
            {
                let value = rx.borrow_and_update().clone();
                if let Some(outcome) = value {
                    return outcome;
                }
            }
            if rx.changed().await.is_err() {
                return Err("authorization task aborted".to_string());
            }
        }
    }

    async fn run_authorization(&self, spec: &OauthSpec, server_url: &str) -> Result<OauthTokens> {
        let metadata = discover_metadata(&self.http, server_url).await?;

        // Loopback redirect target on an ephemeral port, unless configured.
        let listener = match spec.redirect_uri.as_deref().and_then(redirect_port) {
            Some(port) => tokio::net::TcpListener::bind(("127.0.0.1", port)).await?,
            None => tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?,
        };
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{}/callback", port);

        let client_id = if spec.client_id.is_empty() {
            let registration = metadata
                .registration_endpoint
                .as_deref()
                .ok_or_else(|| anyhow!("no clientId configured and server offers no registration endpoint"))?;
            let issued = register_client(&self.http, registration, &redirect_uri).await?;
            info!("registered OAuth client for {}: {}", self.server, issued);
            issued
        } else {
            spec.client_id.clone()
        };

        let mut client = BasicClient::new(ClientId::new(client_id.clone()))
            .set_auth_uri(AuthUrl::new(metadata.authorization_endpoint.clone())?)
            .set_token_uri(TokenUrl::new(metadata.token_endpoint.clone())?)
            .set_redirect_uri(RedirectUrl::new(redirect_uri.clone())?);
        if !spec.client_secret.is_empty() {
            client = client.set_client_secret(ClientSecret::new(spec.client_secret.clone()));
        }

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(spec.scopes.iter().map(|s| Scope::new(s.clone())));
        if spec.pkce_enabled {
            request = request.set_pkce_challenge(pkce_challenge);
        }
        for (key, value) in &spec.extra_params {
            request = request.add_extra_param(key.clone(), value.clone());
        }
        let (auth_url, csrf_token) = request.url();

        self.bus.publish(ProxyEvent::OauthPrompt {
            server_name: self.server.clone(),
            url: auth_url.to_string(),
        });
        if let Err(e) = open::that(auth_url.as_str()) {
            debug!("could not open browser for {}: {}", self.server, e);
        }

        let code = wait_for_code(listener, csrf_token.secret()).await?;

        // Exchange via a direct HTTP call; the oauth2 crate's exchange path
        // couples us to its HTTP client choice.
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code".to_string());
        params.insert("code", code);
        params.insert("redirect_uri", redirect_uri);
        params.insert("client_id", client_id.clone());
        if !spec.client_secret.is_empty() {
            params.insert("client_secret", spec.client_secret.clone());
        }
        if spec.pkce_enabled {
            params.insert("code_verifier", pkce_verifier.secret().to_string());
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("token exchange failed: {}", error_text));
        }
        let token_data: serde_json::Value = response.json().await?;
        if token_data.get("error").is_some() {
            let desc = token_data
                .get("error_description")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(anyhow!("token exchange failed: {}", desc));
        }

        Ok(OauthTokens {
            access_token: token_data["access_token"]
                .as_str()
                .ok_or_else(|| anyhow!("missing access_token"))?
                .to_string(),
            refresh_token: token_data
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            token_uri: metadata.token_endpoint,
            client_id,
            scopes: spec.scopes.clone(),
            expiry: expiry_from(&token_data),
        })
    }

    pub async fn refresh(&self, mut tokens: OauthTokens) -> Result<OauthTokens> {
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| anyhow!("no refresh token available"))?;

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token".to_string());
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", tokens.client_id.clone());

        let response = self
            .http
            .post(&tokens.token_uri)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("token refresh failed: {}", error_text));
        }
        let token_data: serde_json::Value = response.json().await?;
        if token_data.get("error").is_some() {
            let desc = token_data
                .get("error_description")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(anyhow!("token refresh failed: {}", desc));
        }

        tokens.access_token = token_data["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("missing access_token"))?
            .to_string();
        if let Some(new_refresh) = token_data.get("refresh_token").and_then(|v| v.as_str()) {
            tokens.refresh_token = Some(new_refresh.to_string());
        }
        tokens.expiry = expiry_from(&token_data).or(tokens.expiry);
        self.persist(&tokens);
        Ok(tokens)
    }
}

fn expiry_from(token_data: &serde_json::Value) -> Option<u64> {
    token_data
        .get("expires_in")
        .and_then(serde_json::Value::as_u64)
        .and_then(|secs| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|now| now.as_secs() + secs)
        })
}

fn redirect_port(redirect_uri: &str) -> Option<u16> {
    url::Url::parse(redirect_uri).ok()?.port()
}

/// Accept loop for the loopback redirect. Connections with a bad or missing
/// `state` are answered 403 and ignored; the first valid callback wins.
async fn wait_for_code(listener: tokio::net::TcpListener, expected_state: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    loop {
        let (mut stream, _) = listener.accept().await?;
        let mut buffer = [0u8; 4096];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]).to_string();

        let received_state = extract_param_from_request(&request, "state");
        if received_state.as_deref() != Some(expected_state) {
            let response = "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n";
            let _ = stream.write_all(response.as_bytes()).await;
            warn!("OAuth redirect with mismatched state parameter rejected");
            continue;
        }

        if let Some(error) = extract_param_from_request(&request, "error") {
            let response = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
            let _ = stream.write_all(response.as_bytes()).await;
            return Err(anyhow!("authorization denied: {}", error));
        }

        let code = extract_param_from_request(&request, "code")
            .ok_or_else(|| anyhow!("redirect did not carry a code parameter"))?;

        let body = "<html><body>Authorized. You can close this window.</body></html>";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        return Ok(code);
    }
}

fn extract_param_from_request(request: &str, param_name: &str) -> Option<String> {
    let first_line = request.lines().next()?;
    let path_part = first_line.split_whitespace().nth(1)?;
    let query_part = path_part.split('?').nth(1)?;
    for pair in query_part.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == param_name {
                return urlencoding::decode(value).ok().map(|v| v.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DB_FILE;

    fn make_tokens(expiry: Option<u64>) -> OauthTokens {
        OauthTokens {
            access_token: "tok".into(),
            refresh_token: Some("rt".into()),
            token_uri: "https://auth.example/token".into(),
            client_id: "cid".into(),
            scopes: vec!["read".into()],
            expiry,
        }
    }

    #[test]
    fn extract_param_basic() {
        let req = "GET /callback?code=abc123&state=xyz HTTP/1.1\r\nHost: localhost\r\n";
        assert_eq!(
            extract_param_from_request(req, "code"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_param_from_request(req, "state"),
            Some("xyz".to_string())
        );
        assert_eq!(extract_param_from_request(req, "nope"), None);
    }

    #[test]
    fn extract_param_url_encoded() {
        let req = "GET /?code=4%2F0Atest%26more HTTP/1.1\r\n";
        assert_eq!(
            extract_param_from_request(req, "code"),
            Some("4/0Atest&more".to_string())
        );
    }

    #[test]
    fn extract_param_no_query() {
        assert_eq!(extract_param_from_request("GET / HTTP/1.1\r\n", "code"), None);
        assert_eq!(extract_param_from_request("", "code"), None);
    }

    #[test]
    fn freshness_accounts_for_warning_window() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let warn = Duration::from_secs(3600);
        assert!(make_tokens(Some(now + 7200)).is_fresh(warn));
        assert!(!make_tokens(Some(now + 1800)).is_fresh(warn));
        assert!(!make_tokens(Some(now - 10)).is_fresh(warn));
        assert!(!make_tokens(None).is_fresh(warn));
    }

    #[test]
    fn redirect_port_parsing() {
        assert_eq!(redirect_port("http://127.0.0.1:8123/callback"), Some(8123));
        assert_eq!(redirect_port("http://127.0.0.1/callback"), None);
        assert_eq!(redirect_port("not a url"), None);
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
        let flow = Arc::new(OauthFlow::new(
            "gh",
            store,
            EventBus::new(),
            Duration::from_secs(3600),
        ));
        assert!(flow.persisted().is_none());
        flow.persist(&make_tokens(Some(9_999_999_999)));
        let loaded = flow.persisted().unwrap();
        assert_eq!(loaded.access_token, "tok");
        flow.forget();
        assert!(flow.persisted().is_none());
    }

    #[tokio::test]
    async fn concurrent_authorize_requests_share_one_flow() {
        // The flow itself will fail fast (no metadata server), but both
        // callers must receive the same outcome from a single attempt,
        // observable through a single oauth.completed event.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe();
        let flow = Arc::new(OauthFlow::new(
            "gh",
            store,
            bus,
            Duration::from_secs(3600),
        ));
        let spec = OauthSpec::default();

        let a = flow.authorize(spec.clone(), "http://127.0.0.1:1/mcp".into());
        let b = flow.authorize(spec.clone(), "http://127.0.0.1:1/mcp".into());
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_err());
        assert_eq!(ra.unwrap_err(), rb.unwrap_err());

        let mut completed = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ProxyEvent::OauthCompleted { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);

        // gate cleared (the flow task clears it after broadcasting): a new
        // authorization may start
        let mut cleared = false;
        for _ in 0..50 {
            if flow.in_flight.lock().await.is_none() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cleared);
    }
}
