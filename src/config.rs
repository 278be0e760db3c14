use std::net::IpAddr;

use anyhow::bail;

/// Constructor-level configuration for the proxy. There is no file or environment handling
///  here; embedding applications assemble this from whatever front-end they have.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Name of the embedding application, stamped into forwarded login requests.
    pub user_agent: String,
    /// Contact address of the embedding application's author, stamped into forwarded login
    ///  requests.
    pub author: String,

    /// The port the login listener accepts client HTTP connections on.
    pub login_port: u16,
    /// The address client-facing sockets (the login listener and each circuit's proxy
    ///  endpoint) bind to. Must be reachable by the client; the embedded-address rewrite only
    ///  works for IPv4.
    pub client_facing_address: IpAddr,
    /// The address the shared simulator-facing UDP socket binds to.
    pub remote_facing_address: IpAddr,
    /// The real login server, e.g. `http://login.example.grid:8002/cgi-bin/login.cgi`.
    pub remote_login_uri: String,

    /// Log routine proxy notifications at INFO instead of DEBUG.
    pub verbose: bool,
}

impl ProxyConfig {
    pub fn new(user_agent: impl Into<String>, author: impl Into<String>, remote_login_uri: impl Into<String>) -> ProxyConfig {
        ProxyConfig {
            user_agent: user_agent.into(),
            author: author.into(),
            login_port: 8080,
            client_facing_address: IpAddr::from([127, 0, 0, 1]),
            remote_facing_address: IpAddr::from([0, 0, 0, 0]),
            remote_login_uri: remote_login_uri.into(),
            verbose: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.remote_login_uri.starts_with("http://") {
            bail!("remote login URI must be a plain http:// URI, was {:?}", self.remote_login_uri);
        }
        if self.client_facing_address.is_ipv6() {
            bail!("client-facing address must be IPv4: handoff messages embed 4 byte addresses");
        }
        Ok(())
    }
}
