//! Load signals driving the autoscaler

use super::{AutoscaleError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait LoadSource: Send + Sync {
    /// Current load, in the same unit as the policy's capacity per instance
    async fn current_load(&self) -> Result<u64>;
}

/// Fixed load, adjustable at runtime
#[derive(Debug, Default)]
pub struct StaticLoad(AtomicU64);

impl StaticLoad {
    pub fn new(load: u64) -> Self {
        Self(AtomicU64::new(load))
    }

    pub fn set(&self, load: u64) {
        self.0.store(load, Ordering::Relaxed);
    }
}

#[async_trait]
impl LoadSource for StaticLoad {
    async fn current_load(&self) -> Result<u64> {
        Ok(self.0.load(Ordering::Relaxed))
    }
}

/// Current sessions (`scur`) of an HAProxy frontend, read from the CSV stats page
pub struct HaproxyStats {
    client: Client,
    url: String,
    frontend: String,
    credentials: Option<(String, String)>,
}

impl HaproxyStats {
    /// `url` is the CSV export, e.g. `http://lb:8404/stats;csv`
    pub fn new(url: impl Into<String>, frontend: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AutoscaleError::Load(format!("Failed to build stats client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            frontend: frontend.into(),
            credentials: None,
        })
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }
}

#[async_trait]
impl LoadSource for HaproxyStats {
    async fn current_load(&self) -> Result<u64> {
        let mut request = self.client.get(&self.url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AutoscaleError::Load(format!("stats request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AutoscaleError::Load(format!(
                "stats page returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AutoscaleError::Load(format!("Failed to read stats: {}", e)))?;

        let load = parse_haproxy_csv(&body, &self.frontend)?;
        debug!(frontend = %self.frontend, sessions = load, "Read HAProxy load");
        Ok(load)
    }
}

/// Extract `scur` of the FRONTEND row of proxy `frontend`
///
/// The stats export starts with a `# pxname,svname,...` header line and ends
/// every row with a trailing comma.
pub fn parse_haproxy_csv(body: &str, frontend: &str) -> Result<u64> {
    let body = body.trim_start();
    let body = body.strip_prefix('#').unwrap_or(body);
    if body.trim().is_empty() {
        return Err(AutoscaleError::Load("empty stats CSV".to_string()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| AutoscaleError::Load(format!("invalid stats CSV header: {}", e)))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| AutoscaleError::Load(format!("stats CSV has no '{}' column", name)))
    };
    let pxname = column("pxname")?;
    let svname = column("svname")?;
    let scur = column("scur")?;

    for record in reader.records() {
        let record =
            record.map_err(|e| AutoscaleError::Load(format!("invalid stats CSV row: {}", e)))?;
        if record.get(pxname) == Some(frontend) && record.get(svname) == Some("FRONTEND") {
            let value = record.get(scur).unwrap_or_default();
            return value.parse().map_err(|_| {
                AutoscaleError::Load(format!("invalid scur value '{}' for {}", value, frontend))
            });
        }
    }

    Err(AutoscaleError::Load(format!(
        "frontend '{}' not found in stats CSV",
        frontend
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = "\
# pxname,svname,qcur,qmax,scur,smax,slim,stot
http-in,FRONTEND,,,22,40,2000,1093
web,web-01,0,0,11,20,,540
web,web-02,0,0,11,20,,553
web,BACKEND,0,0,22,40,200,1093
";

    #[test]
    fn test_parse_frontend_sessions() {
        assert_eq!(parse_haproxy_csv(STATS, "http-in").unwrap(), 22);
    }

    #[test]
    fn test_parse_ignores_backend_rows() {
        let err = parse_haproxy_csv(STATS, "web").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_parse_missing_column() {
        let body = "# pxname,svname,qcur\nhttp-in,FRONTEND,0\n";
        let err = parse_haproxy_csv(body, "http-in").unwrap_err();
        assert!(err.to_string().contains("scur"));
    }

    #[test]
    fn test_parse_real_export_layout() {
        // Trailing commas and a quoted field, as HAProxy writes them
        let body = "\
# pxname,svname,qcur,qmax,scur,smax,slim,stot,status,
stats,FRONTEND,,,1,2,2000,30,OPEN,
http-in,FRONTEND,,,57,80,2000,9041,OPEN,
web,web-01,0,0,29,41,,4520,\"UP, 2/2\",
web,BACKEND,0,0,57,80,200,9041,UP,
";
        assert_eq!(parse_haproxy_csv(body, "http-in").unwrap(), 57);
        assert_eq!(parse_haproxy_csv(body, "stats").unwrap(), 1);
    }

    #[test]
    fn test_parse_bad_scur_value() {
        let body = "# pxname,svname,scur\nhttp-in,FRONTEND,lots\n";
        let err = parse_haproxy_csv(body, "http-in").unwrap_err();
        assert!(err.to_string().contains("invalid scur"));
    }

    #[test]
    fn test_parse_empty_body() {
        assert!(parse_haproxy_csv("", "http-in").is_err());
    }

    #[tokio::test]
    async fn test_static_load_can_change() {
        let load = StaticLoad::new(5);
        assert_eq!(load.current_load().await.unwrap(), 5);
        load.set(40);
        assert_eq!(load.current_load().await.unwrap(), 40);
    }
}
