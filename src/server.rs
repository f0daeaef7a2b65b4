use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use dhcproto::v4::{Message, MessageType};
use dhcproto::{Decodable, Encodable};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manager::{LeaseManager, Reply, client_id, message_type};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_OPTIONS_OFFSET: usize = 240;
const OPTION_PAD: u8 = 0;
const OPTION_END: u8 = 255;
const OPTION_SERVER_IDENTIFIER: u8 = 54;

/// UDP front end for a [`LeaseManager`].
pub struct DhcpServer {
    manager: Arc<LeaseManager>,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    pub async fn new(config: Config) -> Result<Self> {
        let manager = Arc::new(LeaseManager::new(Arc::new(config)));
        let socket = Self::create_socket()?;

        let config = manager.config();
        info!(
            "DHCP server starting on {}:{}",
            config.server_ip, DHCP_SERVER_PORT
        );
        info!(
            "IP pool: {} - {} ({} addresses)",
            config.pool_start,
            config.pool_end(),
            config.pool_size
        );

        Ok(Self::with_socket(manager, socket))
    }

    /// Serves `manager` on an already bound socket.
    pub fn with_socket(manager: Arc<LeaseManager>, socket: UdpSocket) -> Self {
        Self {
            manager,
            socket: Arc::new(socket),
        }
    }

    fn create_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
            .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
    }

    /// Receives datagrams forever, handling each one on its own task.
    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = PacketHandler {
                        manager: Arc::clone(&self.manager),
                        socket: Arc::clone(&self.socket),
                    };

                    tokio::spawn(async move {
                        if let Err(error) = handler.handle_packet(&data, source).await {
                            warn!("Error handling packet from {}: {}", source, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }

    pub fn manager(&self) -> &LeaseManager {
        &self.manager
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

struct PacketHandler {
    manager: Arc<LeaseManager>,
    socket: Arc<UdpSocket>,
}

impl PacketHandler {
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let Some((encoded, destination)) = self.process(data, source).await? else {
            return Ok(());
        };
        self.socket.send_to(&encoded, destination).await?;
        Ok(())
    }

    /// Decodes one datagram and runs it through the lease manager. Returns
    /// the encoded reply and where to send it, or `None` when nothing goes
    /// out.
    async fn process(&self, data: &[u8], source: SocketAddr) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let request = match decode_message(data) {
            Ok(request) => request,
            Err(error) => {
                debug!("Dropping undecodable datagram from {}: {}", source, error);
                return Ok(None);
            }
        };

        let mac = client_id(&request);
        if let Some(message_type) = message_type(&request) {
            debug!("{:?} from {} ({})", message_type, mac, source);
        }

        match self.manager.handle(&request).await {
            Reply::Send(reply) => {
                let destination = reply_destination(&reply, &request);
                Ok(Some((reply.to_vec()?, destination)))
            }
            Reply::Silent(reason) => {
                debug!("No reply to {} ({}): {}", mac, source, reason.as_str());
                Ok(None)
            }
        }
    }
}

/// Decodes a datagram into a DHCP message.
///
/// Options whose payload must be exactly four bytes are length-checked
/// before the codec sees them: a malformed server identifier would
/// otherwise be skipped, and the bulk-leasequery codes 152-158 trip an
/// assertion inside `dhcproto`. Any other panic in the codec is caught and
/// reported as an invalid packet.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    check_fixed_length_options(data)?;

    match std::panic::catch_unwind(|| Message::from_bytes(data)) {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(error)) => Err(Error::InvalidPacket(error.to_string())),
        Err(_) => Err(Error::InvalidPacket("codec panicked while decoding".to_string())),
    }
}

fn check_fixed_length_options(data: &[u8]) -> Result<()> {
    if data.len() < DHCP_OPTIONS_OFFSET || data[236..DHCP_OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE {
        return Ok(());
    }

    let mut index = DHCP_OPTIONS_OFFSET;
    while index < data.len() {
        let code = data[index];
        match code {
            OPTION_PAD => {
                index += 1;
                continue;
            }
            OPTION_END => break,
            _ => {}
        }

        let Some(&length) = data.get(index + 1) else {
            break;
        };
        let fixed_length = code == OPTION_SERVER_IDENTIFIER || (152..=158).contains(&code);
        if fixed_length && length != 4 {
            return Err(Error::InvalidPacket(format!(
                "option {} has length {}, expected 4",
                code, length
            )));
        }
        index += 2 + usize::from(length);
    }

    Ok(())
}

/// Picks the reply address: the relay if there is one, broadcast for NAKs,
/// broadcast-flagged requests and clients without an address, otherwise
/// unicast to the client.
pub fn reply_destination(reply: &Message, request: &Message) -> SocketAddr {
    let is_nak = message_type(reply) == Some(MessageType::Nak);

    if request.giaddr() != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(request.giaddr()), DHCP_SERVER_PORT)
    } else if is_nak || request.flags().broadcast() || request.ciaddr() == Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr()), DHCP_CLIENT_PORT)
    }
}
