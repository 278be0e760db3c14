//! Login interception. The client is pointed at the proxy's login port instead of the real
//!  login server; the proxy forwards each XML-RPC login exchange upstream, rewrites the
//!  `sim_ip`/`sim_port` members of the reply to a freshly created circuit's proxy endpoint, and
//!  hands the reply back. Every completed exchange resets the sequencing state of all
//!  circuits; a successful login additionally makes the named circuit the active one.
//!
//! The XML-RPC bodies are treated as text: only the two address members are located and
//!  spliced, everything else passes through byte for byte.

use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::LoginError;
use crate::proxy::Shared;

/// A user-supplied hook offered the login request (or response) body for mutation. A failing
///  hook is logged and the unmodified body forwarded; partial mutations are never applied.
pub type LoginHook = Arc<dyn Fn(&mut String) -> anyhow::Result<()> + Send + Sync>;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts login connections until aborted. A failed exchange aborts only that attempt.
pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("error accepting login connection: {}", e);
                continue;
            }
        };

        shared.notice(format_args!("handling login request from {:?}", peer));
        if let Err(e) = handle_login(&shared, stream).await {
            warn!("login exchange with {:?} failed: {}", peer, e);
        }
        // injections made before any circuit was active can go out now
        shared.flush_queued_outgoing().await;
    }
}

pub(crate) async fn handle_login(shared: &Arc<Shared>, stream: TcpStream) -> Result<(), LoginError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let body = read_framed_body(&mut reader, true).await?;
    let mut body = stamp_identification(&body, &shared.config.user_agent, &shared.config.author);
    apply_hook(&shared.login_request_hook, &mut body, "request");

    let (authority, path) = split_login_uri(&shared.config.remote_login_uri)?;
    let mut response = timeout(LOGIN_TIMEOUT, forward_upstream(&authority, &path, &body))
        .await
        .map_err(|_| LoginError::Timeout)??;

    // every completed exchange starts a fresh session on all circuits, whether or not the
    // response names a simulator
    shared.reset_all_circuits().await;
    response = rewrite_handoff(shared, response).await;
    apply_hook(&shared.login_response_hook, &mut response, "response");

    let reply = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
        response.len(),
        response,
    );
    write_half.write_all(reply.as_bytes()).await?;
    let _ = write_half.shutdown().await;
    Ok(())
}

/// Reads one HTTP message: start line, headers, then a body of exactly Content-Length bytes.
///  Without a Content-Length header the body runs to end of stream, which is only acceptable
///  for the close-delimited upstream response (`require_length` false).
async fn read_framed_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    require_length: bool,
) -> Result<String, LoginError> {
    let mut content_length = None;
    let mut line = String::new();
    let mut first = true;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(LoginError::Framing("connection closed before end of headers".to_string()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if first {
                return Err(LoginError::Framing("missing start line".to_string()));
            }
            break;
        }
        first = false;
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }

    let raw = match content_length {
        Some(len) => {
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    LoginError::Framing("body shorter than Content-Length".to_string())
                }
                else {
                    LoginError::Transport(e)
                }
            })?;
            buf
        }
        None if require_length => {
            return Err(LoginError::Framing("missing Content-Length header".to_string()));
        }
        None => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            buf
        }
    };

    String::from_utf8(raw).map_err(|_| LoginError::Framing("body is not valid UTF-8".to_string()))
}

async fn forward_upstream(authority: &str, path: &str, body: &str) -> Result<String, LoginError> {
    let mut upstream = TcpStream::connect(authority).await?;
    let request = format!(
        "POST {} HTTP/1.0\r\nHost: {}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
        path,
        authority,
        body.len(),
        body,
    );
    upstream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(upstream);
    read_framed_body(&mut reader, false).await
}

fn split_login_uri(uri: &str) -> Result<(String, String), LoginError> {
    let rest = uri.strip_prefix("http://")
        .ok_or_else(|| LoginError::Framing(format!("unsupported login URI {:?}", uri)))?;

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let authority = if authority.contains(':') {
        authority.to_string()
    }
    else {
        format!("{}:80", authority)
    };
    Ok((authority, path.to_string()))
}

fn apply_hook(hook: &Mutex<Option<LoginHook>>, body: &mut String, which: &str) {
    let hook = hook.lock().expect("login hook lock poisoned").clone();
    if let Some(hook) = hook {
        let mut candidate = body.clone();
        match hook(&mut candidate) {
            Ok(()) => *body = candidate,
            Err(e) => warn!("login {} hook failed, keeping original body: {:#}", which, e),
        }
    }
}

/// Adds `user-agent` and `author` members identifying the proxying application to the login
///  request's parameter struct.
fn stamp_identification(body: &str, user_agent: &str, author: &str) -> String {
    let Some(pos) = body.rfind("</struct>") else {
        debug!("login request has no parameter struct, forwarding unstamped");
        return body.to_string();
    };

    let members = format!(
        "<member><name>user-agent</name><value><string>{}</string></value></member>\
         <member><name>author</name><value><string>{}</string></value></member>",
        xml_escape(user_agent),
        xml_escape(author),
    );

    let mut stamped = String::with_capacity(body.len() + members.len());
    stamped.push_str(&body[..pos]);
    stamped.push_str(&members);
    stamped.push_str(&body[pos..]);
    stamped
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// If the response names a simulator (`sim_ip` and `sim_port` members), splices in the proxy
///  endpoint standing in for it and makes that circuit the active one. Responses without both
///  members (failed logins, redirects) pass through.
async fn rewrite_handoff(shared: &Arc<Shared>, body: String) -> String {
    let (Some(ip_range), Some(port_range)) =
        (member_value_range(&body, "sim_ip"), member_value_range(&body, "sim_port"))
    else {
        return body;
    };

    let ip = match body[ip_range.clone()].trim().parse::<Ipv4Addr>() {
        Ok(ip) => ip,
        Err(_) => {
            warn!("unparseable sim_ip {:?} in login response, forwarding unrewritten", &body[ip_range]);
            return body;
        }
    };
    let port = match body[port_range.clone()].trim().parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            warn!("unparseable sim_port {:?} in login response, forwarding unrewritten", &body[port_range]);
            return body;
        }
    };
    let real = SocketAddr::from((ip, port));

    let local = match shared.proxy_endpoint(real).await {
        Ok(SocketAddr::V4(local)) => local,
        Ok(local) => {
            warn!("proxy endpoint {:?} is not IPv4, forwarding login response unrewritten", local);
            return body;
        }
        Err(e) => {
            warn!("cannot allocate proxy endpoint for {:?}, forwarding login response unrewritten: {:#}", real, e);
            return body;
        }
    };

    shared.set_active_circuit(real);

    let mut body = body;
    let mut edits = [
        (ip_range, local.ip().to_string()),
        (port_range, local.port().to_string()),
    ];
    // splice back to front so earlier ranges stay valid
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));
    for (range, replacement) in edits {
        body.replace_range(range, &replacement);
    }
    body
}

/// The byte range of the text inside `<name>{name}</name><value>...</value>`, skipping one
///  optional type element such as `<string>` or `<i4>`.
fn member_value_range(body: &str, name: &str) -> Option<Range<usize>> {
    let name_tag = format!("<name>{}</name>", name);
    let name_pos = body.find(&name_tag)?;

    let value_start = body[name_pos..].find("<value>")? + name_pos + "<value>".len();
    let value_end = body[value_start..].find("</value>")? + value_start;

    let inner = &body[value_start..value_end];
    if let Some(rest) = inner.strip_prefix('<') {
        if let Some(tag_end) = rest.find('>') {
            let closing = format!("</{}>", &rest[..tag_end]);
            if inner.ends_with(&closing) {
                return Some(value_start + 1 + tag_end + 1..value_end - closing.len());
            }
        }
    }
    Some(value_start..value_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use rstest::rstest;
    use tokio::net::UdpSocket;

    fn login_request(body: &str) -> Vec<u8> {
        format!(
            "POST / HTTP/1.0\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body,
        ).into_bytes()
    }

    #[tokio::test]
    async fn test_read_framed_body() {
        let raw = login_request("<methodCall/>");
        let mut reader = BufReader::new(&raw[..]);
        assert_eq!(read_framed_body(&mut reader, true).await.unwrap(), "<methodCall/>");
    }

    #[tokio::test]
    async fn test_read_framed_body_case_insensitive_header() {
        let raw = b"POST / HTTP/1.0\r\ncontent-length: 2\r\n\r\nok";
        let mut reader = BufReader::new(&raw[..]);
        assert_eq!(read_framed_body(&mut reader, true).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_read_framed_body_missing_length_is_framing_error() {
        let raw = b"POST / HTTP/1.0\r\n\r\n<methodCall/>";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_framed_body(&mut reader, true).await,
            Err(LoginError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_read_framed_body_truncated_body_is_framing_error() {
        let raw = b"POST / HTTP/1.0\r\nContent-Length: 100\r\n\r\nshort";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_framed_body(&mut reader, true).await,
            Err(LoginError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_read_framed_body_without_length_reads_to_eof() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\neverything until close";
        let mut reader = BufReader::new(&raw[..]);
        assert_eq!(
            read_framed_body(&mut reader, false).await.unwrap(),
            "everything until close"
        );
    }

    #[rstest]
    #[case::with_port("http://login.example.grid:8002/cgi-bin/login.cgi", "login.example.grid:8002", "/cgi-bin/login.cgi")]
    #[case::default_port("http://login.example.grid/login.cgi", "login.example.grid:80", "/login.cgi")]
    #[case::bare_host("http://login.example.grid:8002", "login.example.grid:8002", "/")]
    fn test_split_login_uri(#[case] uri: &str, #[case] authority: &str, #[case] path: &str) {
        let (a, p) = split_login_uri(uri).unwrap();
        assert_eq!(a, authority);
        assert_eq!(p, path);
    }

    #[test]
    fn test_stamp_identification() {
        let body = "<methodCall><params><param><value><struct>\
                    <member><name>first</name><value><string>Test</string></value></member>\
                    </struct></value></param></params></methodCall>";
        let stamped = stamp_identification(body, "testapp <1.0>", "test@example.com");

        assert!(stamped.contains("<name>user-agent</name><value><string>testapp &lt;1.0&gt;</string></value>"));
        assert!(stamped.contains("<name>author</name><value><string>test@example.com</string></value>"));
        // the stamped members sit inside the parameter struct
        assert!(stamped.find("user-agent").unwrap() < stamped.find("</struct>").unwrap());
        assert!(stamped.contains("<name>first</name>"));
    }

    #[rstest]
    #[case::string_typed("<member><name>sim_ip</name><value><string>10.0.0.7</string></value></member>", "10.0.0.7")]
    #[case::untyped("<member><name>sim_ip</name><value>10.0.0.7</value></member>", "10.0.0.7")]
    fn test_member_value_range(#[case] body: &str, #[case] expected: &str) {
        let range = member_value_range(body, "sim_ip").unwrap();
        assert_eq!(&body[range], expected);
    }

    #[test]
    fn test_member_value_range_absent() {
        assert!(member_value_range("<methodResponse/>", "sim_ip").is_none());
    }

    fn login_response_body(ip: &str, port: u16) -> String {
        format!(
            "<methodResponse><params><param><value><struct>\
             <member><name>sim_ip</name><value><string>{}</string></value></member>\
             <member><name>sim_port</name><value><i4>{}</i4></value></member>\
             <member><name>login</name><value><string>true</string></value></member>\
             </struct></value></param></params></methodResponse>",
            ip, port,
        )
    }

    async fn test_shared() -> Arc<Shared> {
        let remote = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Arc::new(Shared::new(
            ProxyConfig::new("test", "test@example.com", "http://127.0.0.1:1/login.cgi"),
            Arc::new(remote),
        ))
    }

    #[tokio::test]
    async fn test_rewrite_handoff_splices_proxy_endpoint() {
        let shared = test_shared().await;
        let rewritten = rewrite_handoff(&shared, login_response_body("127.0.0.1", 13009)).await;

        let ip_range = member_value_range(&rewritten, "sim_ip").unwrap();
        let port_range = member_value_range(&rewritten, "sim_port").unwrap();
        let spliced: SocketAddr = format!("{}:{}", &rewritten[ip_range], &rewritten[port_range])
            .parse().unwrap();

        let endpoint = shared.proxy_endpoint("127.0.0.1:13009".parse().unwrap()).await.unwrap();
        assert_eq!(spliced, endpoint);
        assert_ne!(spliced.port(), 13009);
        // unrelated members survive untouched
        assert!(rewritten.contains("<member><name>login</name><value><string>true</string></value></member>"));
    }

    #[tokio::test]
    async fn test_rewrite_handoff_passes_through_without_sim_members() {
        let shared = test_shared().await;
        let body = "<methodResponse><params><param><value><struct>\
                    <member><name>login</name><value><string>false</string></value></member>\
                    </struct></value></param></params></methodResponse>".to_string();
        assert_eq!(rewrite_handoff(&shared, body.clone()).await, body);
    }

    #[tokio::test]
    async fn test_completed_login_without_sim_members_resets_circuits() {
        use crate::direction::Direction;
        use crate::packet::{HeaderFlags, Packet, PacketBody, PacketType};

        // the upstream reply reports a failed login: no sim members
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            read_framed_body(&mut reader, true).await.unwrap();

            let body = "<methodResponse><params><param><value><struct>\
                        <member><name>login</name><value><string>false</string></value></member>\
                        </struct></value></param></params></methodResponse>";
            let reply = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
                body.len(), body,
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.shutdown().await.unwrap();
        });

        let remote = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut config = ProxyConfig::new("test", "test@example.com",
            format!("http://127.0.0.1:{}/login.cgi", upstream_addr.port()));
        config.verbose = false;
        let shared = Arc::new(Shared::new(config, Arc::new(remote)));

        // a pre-existing circuit with live sequencing state
        let simulator = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let real = simulator.local_addr().unwrap();
        shared.proxy_endpoint(real).await.unwrap();
        let session = shared.session_for(real).unwrap();

        let plain_packet = || Packet::new(
            PacketType::Other(700),
            HeaderFlags::empty(),
            PacketBody::Opaque(bytes::Bytes::from_static(&[1])),
        );
        let mut buf = [0u8; 1500];

        session.inject(plain_packet(), Direction::Outgoing).await;
        let (len, _) = timeout(Duration::from_secs(5), simulator.recv_from(&mut buf))
            .await.unwrap().unwrap();
        assert_eq!(Packet::deser(&buf[..len]).unwrap().header.sequence, 1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let login_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut client = TcpStream::connect(login_addr).await.unwrap();
            client.write_all(&login_request("<methodCall/>")).await.unwrap();
            let mut reader = BufReader::new(client);
            read_framed_body(&mut reader, true).await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        handle_login(&shared, stream).await.unwrap();

        // sequencing starts over on the surviving circuit
        session.inject(plain_packet(), Direction::Outgoing).await;
        let (len, _) = timeout(Duration::from_secs(5), simulator.recv_from(&mut buf))
            .await.unwrap().unwrap();
        assert_eq!(Packet::deser(&buf[..len]).unwrap().header.sequence, 1);
    }

    #[tokio::test]
    async fn test_full_login_exchange() {
        // fake upstream login server
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let upstream_task = tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let request = read_framed_body(&mut reader, true).await.unwrap();

            let body = login_response_body("127.0.0.1", 13031);
            let reply = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
                body.len(), body,
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.shutdown().await.unwrap();
            request
        });

        let remote = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut config = ProxyConfig::new("testapp", "test@example.com",
            format!("http://127.0.0.1:{}/login.cgi", upstream_addr.port()));
        config.verbose = false;
        let shared = Arc::new(Shared::new(config, Arc::new(remote)));

        // client side of the exchange
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let login_addr = listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move {
            let mut client = TcpStream::connect(login_addr).await.unwrap();
            let body = "<methodCall><methodName>login_to_simulator</methodName>\
                        <params><param><value><struct>\
                        <member><name>first</name><value><string>Test</string></value></member>\
                        </struct></value></param></params></methodCall>";
            client.write_all(&login_request(body)).await.unwrap();

            let mut reader = BufReader::new(client);
            read_framed_body(&mut reader, true).await.unwrap()
        });

        let (stream, _) = listener.accept().await.unwrap();
        handle_login(&shared, stream).await.unwrap();

        let upstream_request = upstream_task.await.unwrap();
        assert!(upstream_request.contains("<name>user-agent</name><value><string>testapp</string></value>"));
        assert!(upstream_request.contains("<name>author</name>"));
        assert!(upstream_request.contains("<name>first</name>"));

        let client_response = client_task.await.unwrap();
        let port_range = member_value_range(&client_response, "sim_port").unwrap();
        let spliced_port: u16 = client_response[port_range].parse().unwrap();
        assert_ne!(spliced_port, 13031);

        let endpoint = shared.proxy_endpoint("127.0.0.1:13031".parse().unwrap()).await.unwrap();
        assert_eq!(spliced_port, endpoint.port());
    }
}
