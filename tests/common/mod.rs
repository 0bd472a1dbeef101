//! Mock APRS-IS server for integration tests
//!
//! Each `serve_session` call accepts one client, answers its login with a
//! `# logresp` line, writes the given packets and hangs up.
//!
//! ```no_run
//! use common::MockAprsServer;
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let server = MockAprsServer::bind().await;
//!     let config = server.client_config().build();
//!     // Start a worker with `config`, then drive sessions:
//!     server.serve_session(&["K1ABC>APRS:>status"]).await;
//! }
//! ```

#![allow(dead_code)]

use std::time::Duration;

use aprs_weather::aprs_client::AprsClientConfigBuilder;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Weather report: temperature 71, humidity 55, pressure 1013.2, wind 220/4 gust 5
pub const WEATHER_LINE: &str =
    "K1ABC>APRS,TCPIP*,qAC,T2TEST:!5957.00N/03018.00E_220/004g005t071h55b10132";

/// Same station, temperature 72
pub const WEATHER_LINE_WARMER: &str =
    "K1ABC>APRS,TCPIP*,qAC,T2TEST:!5957.00N/03018.00E_220/004g005t072h55b10132";

/// Plain position report, no weather
pub const POSITION_LINE: &str = "W2XYZ>APRS,TCPIP*,qAC,T2TEST:!4021.00N/07400.00W>Mobile";

pub struct MockAprsServer {
    listener: TcpListener,
    verified: bool,
}

impl MockAprsServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock APRS-IS server");
        Self {
            listener,
            verified: false,
        }
    }

    /// Answer logins with `verified` instead of `unverified`
    pub fn verifying(mut self) -> Self {
        self.verified = true;
        self
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Client config pointing at this server with immediate reconnects
    pub fn client_config(&self) -> AprsClientConfigBuilder {
        AprsClientConfigBuilder::new()
            .server("127.0.0.1")
            .port(self.port())
            .callsign("N0CALL")
            .retry_delay_seconds(0)
            .login_timeout(Duration::from_secs(5))
    }

    async fn accept_and_login(&self) -> (TcpStream, String) {
        let (socket, _) = self.listener.accept().await.expect("accept failed");
        let mut socket = BufReader::new(socket);
        socket
            .get_mut()
            .write_all(b"# aprsc 2.1.19 mock\r\n")
            .await
            .unwrap();

        let mut login = String::new();
        socket.read_line(&mut login).await.unwrap();
        let callsign = login
            .split_whitespace()
            .nth(1)
            .unwrap_or("N0CALL")
            .to_string();
        let status = if self.verified { "verified" } else { "unverified" };
        socket
            .get_mut()
            .write_all(format!("# logresp {} {}, server MOCK\r\n", callsign, status).as_bytes())
            .await
            .unwrap();

        (socket.into_inner(), login)
    }

    async fn send_lines(socket: &mut TcpStream, lines: &[&str]) {
        for line in lines {
            socket
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
        }
        socket.flush().await.unwrap();
    }

    /// Serve one connection: log in, send `lines`, close. Returns the login line.
    pub async fn serve_session(&self, lines: &[&str]) -> String {
        let (mut socket, login) = self.accept_and_login().await;
        Self::send_lines(&mut socket, lines).await;
        login
    }

    /// Serve one connection and keep it open for `hold`
    pub async fn serve_and_hold(&self, lines: &[&str], hold: Duration) -> String {
        let (mut socket, login) = self.accept_and_login().await;
        Self::send_lines(&mut socket, lines).await;
        tokio::time::sleep(hold).await;
        login
    }

    /// Whether another client connects within `wait`
    pub async fn accepts_within(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.listener.accept())
            .await
            .is_ok()
    }
}
