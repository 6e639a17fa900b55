use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Agent string sent to casters. NTRIP casters expect it to start with `NTRIP`.
pub const USER_AGENT: &str = concat!("NTRIP ntrip-bridge/", env!("CARGO_PKG_VERSION"));

/// Basic-auth credentials for a caster mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: Option<&str>) -> Self {
        Self {
            user: user.into(),
            password: password.map(str::to_string),
        }
    }

    /// Value of the `Authorization` header: `Basic base64(user:password)`.
    ///
    /// A missing password encodes as the empty string.
    pub fn authorization(&self) -> String {
        let raw = format!("{}:{}", self.user, self.password.as_deref().unwrap_or(""));
        format!("Basic {}", STANDARD.encode(raw))
    }
}

/// Build the NTRIP request for `mountpoint` on `host`.
///
/// The `Authorization` header is only emitted for credentials with a
/// non-empty user. The request is terminated by a blank line so the caster
/// can start answering as soon as it has been written.
pub fn build_request(mountpoint: &str, host: &str, credentials: Option<&Credentials>) -> Vec<u8> {
    let path = mountpoint.trim_start_matches('/');
    debug_assert!(
        !path.contains(char::is_whitespace) && !host.contains(char::is_whitespace),
        "mountpoint and host must be single tokens"
    );

    let mut request = format!("GET /{path} HTTP/1.1\r\n");
    request.push_str(&format!("Host: {host}\r\n"));
    request.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
    if let Some(creds) = credentials.filter(|c| !c.user.is_empty()) {
        request.push_str(&format!("Authorization: {}\r\n", creds.authorization()));
    }
    request.push_str("Connection: keep-alive\r\n");
    request.push_str("Ntrip-Version: Ntrip/2.0\r\n");
    request.push_str("\r\n");

    request.into_bytes()
}
