use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// The seam between the packet pump and actual UDP I/O, introduced so the sequencing logic can
///  be tested against a mock. A send failure is logged and the datagram dropped - per-packet
///  transport errors never terminate a circuit.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    /// The local address the socket is bound to. Deliberately not named `local_addr`: that
    ///  would shadow the inherent `UdpSocket::local_addr` wherever this trait is in scope.
    fn bound_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("sending {} byte datagram to {:?}", buf.len(), to);

        if let Err(e) = self.send_to(buf, to).await {
            error!("error sending datagram to {:?}: {}", to, e);
        }
    }

    fn bound_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("a bound UdpSocket has a local address")
    }
}
