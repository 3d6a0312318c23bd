//! Public hostname discovery
//!
//! Order: `--domain`, then `proxy.server_name`, then the EC2 instance
//! metadata service (IMDSv2 token first, v1 as fallback), then `_`
//! (nginx catch-all).

use std::time::Duration;
use ureq::Agent;

/// Link-local EC2 metadata endpoint
pub const METADATA_BASE: &str = "http://169.254.169.254";

/// Catch-all server name
pub const CATCH_ALL: &str = "_";

const METADATA_TIMEOUT: Duration = Duration::from_secs(2);
const TOKEN_TTL: &str = "21600";

/// Resolve the hostname interpolated into the vhost and CORS origin
pub fn public_host(domain: Option<&str>, configured: Option<&str>) -> String {
    resolve(domain, configured, METADATA_BASE)
}

pub fn resolve(domain: Option<&str>, configured: Option<&str>, metadata_base: &str) -> String {
    if let Some(host) = domain.or(configured).map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }

    match metadata_address(metadata_base) {
        Some(address) => {
            log::info!("Discovered public address {address} from instance metadata");
            address
        }
        None => {
            log::warn!("No public hostname configured or discoverable; using catch-all");
            CATCH_ALL.to_string()
        }
    }
}

fn agent() -> Agent {
    let config = Agent::config_builder()
        .timeout_global(Some(METADATA_TIMEOUT))
        .http_status_as_error(false)
        .build();
    Agent::new_with_config(config)
}

/// Public IPv4 from the metadata service, if reachable
fn metadata_address(base: &str) -> Option<String> {
    let agent = agent();
    let url = format!("{base}/latest/meta-data/public-ipv4");

    let token = imds_token(&agent, base);
    let mut request = agent.get(&url);
    if let Some(token) = &token {
        request = request.header("X-aws-ec2-metadata-token", token);
    }

    let mut response = match request.call() {
        Ok(r) => r,
        Err(e) => {
            log::debug!("Instance metadata unreachable: {e}");
            return None;
        }
    };
    if response.status().as_u16() != 200 {
        log::debug!("Instance metadata answered HTTP {}", response.status());
        return None;
    }

    let body = response.body_mut().read_to_string().ok()?;
    let address = body.trim();
    is_host(address).then(|| address.to_string())
}

/// IMDSv2 session token; `None` falls back to IMDSv1
fn imds_token(agent: &Agent, base: &str) -> Option<String> {
    let mut response = agent
        .put(format!("{base}/latest/api/token"))
        .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL)
        .send_empty()
        .ok()?;
    if response.status().as_u16() != 200 {
        return None;
    }
    let token = response.body_mut().read_to_string().ok()?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Plausible hostname or address (rejects HTML error pages and the like)
fn is_host(text: &str) -> bool {
    !text.is_empty()
        && text.len() <= 253
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}
