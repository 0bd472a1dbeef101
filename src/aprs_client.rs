use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use crate::errors::FeedError;

/// Passcode that requests a receive-only session
pub const RECEIVE_ONLY_PASSCODE: &str = "-1";

const CLIENT_NAME: &str = "aprs-weather";

/// Configuration for the APRS-IS connection
#[derive(Debug, Clone)]
pub struct AprsClientConfig {
    /// APRS-IS server hostname
    pub server: String,
    /// APRS-IS server port
    pub port: u16,
    /// Callsign for authentication
    pub callsign: String,
    /// APRS-IS passcode; `None` or `-1` logs in receive-only
    pub passcode: Option<String>,
    /// Server-side filter (optional)
    pub filter: Option<String>,
    /// Initial delay between reconnection attempts in seconds (doubles on every failure)
    pub retry_delay_seconds: u64,
    /// Maximum delay between reconnection attempts in seconds
    pub max_retry_delay_seconds: u64,
    /// How long to wait for the `# logresp` line after logging in
    pub login_timeout: Duration,
    /// Idle time after which a keepalive comment is sent
    pub keepalive_interval: Duration,
    /// The connection is considered dead after this long without data
    pub message_timeout: Duration,
}

impl Default for AprsClientConfig {
    fn default() -> Self {
        Self {
            server: "rotate.aprs2.net".to_string(),
            port: 14580,
            callsign: "N0CALL".to_string(),
            passcode: None,
            filter: None,
            retry_delay_seconds: 0, // Reconnect immediately on first failure
            max_retry_delay_seconds: 60,
            login_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(20),
            message_timeout: Duration::from_secs(300),
        }
    }
}

impl AprsClientConfig {
    pub fn is_receive_only(&self) -> bool {
        match self.passcode.as_deref() {
            None => true,
            Some(passcode) => passcode.trim() == RECEIVE_ONLY_PASSCODE,
        }
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Build the login command for APRS-IS authentication
    pub fn login_command(&self) -> String {
        let mut login_cmd = format!("user {} pass ", self.callsign);

        // Use -1 for read-only access
        match &self.passcode {
            Some(pass) => login_cmd.push_str(pass),
            None => login_cmd.push_str(RECEIVE_ONLY_PASSCODE),
        }

        login_cmd.push_str(" vers ");
        login_cmd.push_str(CLIENT_NAME);
        login_cmd.push(' ');
        login_cmd.push_str(env!("CARGO_PKG_VERSION"));

        if let Some(filter) = &self.filter {
            login_cmd.push_str(" filter ");
            login_cmd.push_str(filter);
        }

        login_cmd.push_str("\r\n");
        login_cmd
    }
}

/// Builder pattern for creating APRS client configurations
pub struct AprsClientConfigBuilder {
    config: AprsClientConfig,
}

impl AprsClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AprsClientConfig::default(),
        }
    }

    pub fn server<S: Into<String>>(mut self, server: S) -> Self {
        self.config.server = server.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn callsign<S: Into<String>>(mut self, callsign: S) -> Self {
        self.config.callsign = callsign.into();
        self
    }

    pub fn passcode<S: Into<String>>(mut self, passcode: Option<S>) -> Self {
        self.config.passcode = passcode.map(|p| p.into());
        self
    }

    pub fn filter<S: Into<String>>(mut self, filter: Option<S>) -> Self {
        self.config.filter = filter.map(|f| f.into());
        self
    }

    pub fn retry_delay_seconds(mut self, seconds: u64) -> Self {
        self.config.retry_delay_seconds = seconds;
        self
    }

    pub fn max_retry_delay_seconds(mut self, seconds: u64) -> Self {
        self.config.max_retry_delay_seconds = seconds;
        self
    }

    pub fn login_timeout(mut self, login_timeout: Duration) -> Self {
        self.config.login_timeout = login_timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn message_timeout(mut self, message_timeout: Duration) -> Self {
        self.config.message_timeout = message_timeout;
        self
    }

    pub fn build(self) -> AprsClientConfig {
        self.config
    }
}

impl Default for AprsClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed `# logresp` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub callsign: String,
    pub verified: bool,
    pub server: Option<String>,
}

impl LoginResponse {
    /// Parse `# logresp <call> <verified|unverified>, server <name>`
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('#')?.trim_start().strip_prefix("logresp")?;
        let mut parts = rest.split_whitespace();
        let callsign = parts.next()?.to_string();
        let status = parts.next()?.trim_end_matches(',');
        let verified = match status {
            "verified" => true,
            "unverified" => false,
            _ => return None,
        };
        let server = match parts.next() {
            Some("server") => parts.next().map(str::to_string),
            _ => None,
        };
        Some(Self {
            callsign,
            verified,
            server,
        })
    }

    /// Check this response against the credentials that were sent
    pub fn verify(&self, config: &AprsClientConfig) -> Result<(), FeedError> {
        if !self.callsign.eq_ignore_ascii_case(&config.callsign) {
            return Err(FeedError::Authentication {
                callsign: config.callsign.clone(),
                reason: format!("server answered for callsign {}", self.callsign),
            });
        }
        if !self.verified && !config.is_receive_only() {
            return Err(FeedError::Authentication {
                callsign: config.callsign.clone(),
                reason: "passcode not accepted (unverified)".to_string(),
            });
        }
        Ok(())
    }
}

/// Server comment that rejects the login outright
fn is_login_rejection(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("not allowed") || lower.contains("invalid")
}

enum Wake {
    Read(std::io::Result<usize>),
    Keepalive,
    Idle,
}

/// An authenticated APRS-IS session yielding raw lines
pub struct FeedConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    line_buffer: Vec<u8>,
    last_write: Instant,
    last_data: Instant,
    keepalive_interval: Duration,
    message_timeout: Duration,
    login: Option<LoginResponse>,
    banner: Option<String>,
}

impl FeedConnection {
    /// Resolve, connect and log in.
    ///
    /// Returns once the server has acknowledged the login with `# logresp`.
    #[tracing::instrument(skip(config), fields(server = %config.server, port = %config.port))]
    pub async fn connect(config: &AprsClientConfig) -> Result<Self, FeedError> {
        let server_address = config.server_address();
        let addrs = resolve(&server_address).await?;

        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!("Connected to APRS server at {}", addr);
                    metrics::counter!("aprs.connection.established_total").increment(1);
                    let mut connection = Self::from_stream(stream, *addr, config);
                    connection.login(config).await?;
                    metrics::gauge!("aprs.connection.connected").set(1.0);
                    return Ok(connection);
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        metrics::counter!("aprs.connection_failed_total").increment(1);
        Err(FeedError::transport(format!(
            "failed to connect to any resolved address for {}: {:?}",
            server_address, last_error
        )))
    }

    fn from_stream(stream: TcpStream, peer_addr: SocketAddr, config: &AprsClientConfig) -> Self {
        let (reader, writer) = stream.into_split();
        let now = Instant::now();
        Self {
            reader: BufReader::new(reader),
            writer,
            peer_addr,
            line_buffer: Vec::new(),
            last_write: now,
            last_data: now,
            keepalive_interval: config.keepalive_interval,
            message_timeout: config.message_timeout,
            login: None,
            banner: None,
        }
    }

    async fn login(&mut self, config: &AprsClientConfig) -> Result<(), FeedError> {
        let login_cmd = config.login_command();
        info!("Sending login command: {}", login_cmd.trim());
        self.send(&login_cmd).await?;

        let deadline = Instant::now() + config.login_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match timeout(remaining, self.next_line()).await {
                Ok(line) => line?,
                Err(_) => {
                    return Err(FeedError::transport(format!(
                        "no login response from {} within {}s",
                        self.peer_addr,
                        config.login_timeout.as_secs()
                    )));
                }
            };

            if !line.starts_with('#') {
                trace!("Ignoring packet received before login response: {}", line);
                continue;
            }

            if let Some(response) = LoginResponse::parse(&line) {
                if let Err(e) = response.verify(config) {
                    metrics::counter!("aprs.login.rejected_total").increment(1);
                    return Err(e);
                }
                if response.verified {
                    info!("Login verified by {:?}", response.server);
                } else {
                    info!("Login successful (receive only) on {:?}", response.server);
                }
                self.login = Some(response);
                return Ok(());
            }

            if is_login_rejection(&line) {
                metrics::counter!("aprs.login.rejected_total").increment(1);
                return Err(FeedError::Authentication {
                    callsign: config.callsign.clone(),
                    reason: line.trim_start_matches('#').trim().to_string(),
                });
            }

            if self.banner.is_none() {
                info!("First message from server: {}", line);
                self.banner = Some(line);
            }
        }
    }

    /// The next non-empty line from the server.
    ///
    /// Sends keepalives while idle; fails with `Transport` on EOF, read errors
    /// or when nothing arrives within the message timeout.
    pub async fn next_line(&mut self) -> Result<String, FeedError> {
        loop {
            let keepalive_at = self.last_write + self.keepalive_interval;
            let idle_deadline = self.last_data + self.message_timeout;

            let wake = tokio::select! {
                read = self.reader.read_until(b'\n', &mut self.line_buffer) => Wake::Read(read),
                _ = sleep_until(keepalive_at) => Wake::Keepalive,
                _ = sleep_until(idle_deadline) => Wake::Idle,
            };

            match wake {
                Wake::Read(Ok(0)) => {
                    metrics::gauge!("aprs.connection.connected").set(0.0);
                    metrics::counter!("aprs.connection.server_closed_total").increment(1);
                    return Err(FeedError::transport(format!(
                        "connection closed by {}",
                        self.peer_addr
                    )));
                }
                Wake::Read(Ok(_)) => {
                    self.last_data = Instant::now();
                    if !self.line_buffer.ends_with(b"\n") {
                        // Partial line before EOF; the next read reports the close
                        continue;
                    }
                    let bytes = std::mem::take(&mut self.line_buffer);
                    let line = match String::from_utf8(bytes) {
                        Ok(line) => line,
                        Err(_) => {
                            debug!("Invalid UTF-8 in stream, skipping");
                            metrics::counter!("aprs.raw_message.invalid_utf8_total").increment(1);
                            continue;
                        }
                    };

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if trimmed.starts_with('#') {
                        metrics::counter!("aprs.raw_message.received.server_total").increment(1);
                    } else {
                        metrics::counter!("aprs.raw_message.received.aprs_total").increment(1);
                    }
                    return Ok(trimmed.to_string());
                }
                Wake::Read(Err(e)) => {
                    metrics::gauge!("aprs.connection.connected").set(0.0);
                    return Err(FeedError::transport(format!("connection error: {}", e)));
                }
                Wake::Keepalive => self.send_keepalive().await?,
                Wake::Idle => {
                    metrics::gauge!("aprs.connection.connected").set(0.0);
                    metrics::counter!("aprs.connection.timeout_total").increment(1);
                    return Err(FeedError::transport(format!(
                        "no data received for {}s",
                        self.message_timeout.as_secs()
                    )));
                }
            }
        }
    }

    async fn send_keepalive(&mut self) -> Result<(), FeedError> {
        self.send(&format!("# {} keepalive\r\n", CLIENT_NAME)).await?;
        trace!("Sent keepalive to APRS server");
        metrics::counter!("aprs.keepalive.sent_total").increment(1);
        Ok(())
    }

    async fn send(&mut self, data: &str) -> Result<(), FeedError> {
        self.writer
            .write_all(data.as_bytes())
            .await
            .map_err(|e| FeedError::transport(format!("failed to send to {}: {}", self.peer_addr, e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| FeedError::transport(format!("failed to flush to {}: {}", self.peer_addr, e)))?;
        self.last_write = Instant::now();
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The acknowledged login, available once `connect` has returned
    pub fn login_response(&self) -> Option<&LoginResponse> {
        self.login.as_ref()
    }

    /// First server comment line, usually the server software banner
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }
}

/// Resolve the server, preferring IPv4 addresses, in random order
async fn resolve(server_address: &str) -> Result<Vec<SocketAddr>, FeedError> {
    let all_addrs: Vec<SocketAddr> = tokio::net::lookup_host(server_address)
        .await
        .map_err(|e| FeedError::transport(format!("DNS resolution failed for {}: {}", server_address, e)))?
        .collect();

    if all_addrs.is_empty() {
        return Err(FeedError::transport(format!(
            "DNS resolution returned no addresses for {}",
            server_address
        )));
    }

    let ipv4_addrs: Vec<SocketAddr> = all_addrs.iter().filter(|a| a.is_ipv4()).cloned().collect();
    let mut addrs = if ipv4_addrs.is_empty() {
        warn!(
            "No IPv4 addresses found for {}, falling back to all addresses",
            server_address
        );
        all_addrs
    } else {
        debug!(
            "DNS resolved {} to {} IPv4 address(es)",
            server_address,
            ipv4_addrs.len()
        );
        ipv4_addrs
    };

    {
        use rand::seq::SliceRandom;
        let mut rng = rand::rng();
        addrs.shuffle(&mut rng);
    }

    Ok(addrs)
}
