//! Server-side DHCP lease state machine.
//!
//! [`LeaseManager::handle`] is called once per inbound message and decides
//! what, if anything, goes back on the wire:
//!
//! - DISCOVER → OFFER, or silence when the pool is exhausted
//! - REQUEST → ACK or NAK, or silence when the client picked another server
//! - RELEASE / DECLINE → the client's lease is freed, nothing is sent
//!
//! Per client the flow is `unknown → offered → bound → unknown`. A REQUEST
//! for an address bound to somebody else is NAKed and leaves that binding
//! alone.
//!
//! # Thread Safety
//!
//! The lease table sits behind one [`Mutex`] that is held for the whole of
//! a `handle` call, so the scan-then-update sequences below never
//! interleave even when the transport handles datagrams concurrently.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::lease::{Claim, Lease, LeasePool, LeaseTable, format_hardware_address};
use crate::options::ServerOptions;

/// What the transport should do with an inbound message.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Encode and send this message.
    Send(Message),
    /// Send nothing.
    Silent(Silence),
}

/// Why a message produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Silence {
    /// Every pool address holds an unexpired lease. The client retries on
    /// its own timer.
    PoolExhausted,
    /// The REQUEST names a different server identifier.
    ForeignServer,
    /// RELEASE and DECLINE are never answered.
    NoReplyExpected,
    /// Not a client message this server acts on.
    Ignored,
}

impl Silence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Silence::PoolExhausted => "PoolExhausted",
            Silence::ForeignServer => "ForeignServer",
            Silence::NoReplyExpected => "NoReplyExpected",
            Silence::Ignored => "Ignored",
        }
    }
}

/// Owns the address pool and lease table.
#[derive(Debug)]
pub struct LeaseManager {
    config: Arc<Config>,
    options: ServerOptions,
    table: Mutex<LeaseTable>,
}

impl LeaseManager {
    pub fn new(config: Arc<Config>) -> Self {
        let options = ServerOptions::from_config(&config);
        let table = LeaseTable::new(LeasePool::from_config(&config));
        Self {
            config,
            options,
            table: Mutex::new(table),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handles one inbound message against the current time.
    pub async fn handle(&self, request: &Message) -> Reply {
        self.handle_at(request, Utc::now()).await
    }

    /// Handles one inbound message as if the clock read `now`.
    pub async fn handle_at(&self, request: &Message, now: DateTime<Utc>) -> Reply {
        if request.opcode() != Opcode::BootRequest {
            return Reply::Silent(Silence::Ignored);
        }

        let Some(message_type) = message_type(request) else {
            debug!("Ignoring message without a DHCP message type");
            return Reply::Silent(Silence::Ignored);
        };

        let client_id = client_id(request);
        let mut table = self.table.lock().await;

        match message_type {
            MessageType::Discover => self.handle_discover(&mut table, request, &client_id, now),
            MessageType::Request => self.handle_request(&mut table, request, &client_id, now),
            MessageType::Release | MessageType::Decline => {
                match table.release_client(&client_id) {
                    Some(index) => info!(
                        client = %client_id,
                        address = ?table.pool().address(index),
                        "{:?}: lease freed",
                        message_type
                    ),
                    None => debug!(client = %client_id, "{:?} from client without a lease", message_type),
                }
                Reply::Silent(Silence::NoReplyExpected)
            }
            other => {
                debug!(client = %client_id, "Ignoring {:?} message", other);
                Reply::Silent(Silence::Ignored)
            }
        }
    }

    fn handle_discover(
        &self,
        table: &mut LeaseTable,
        request: &Message,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Reply {
        let index = match table
            .find_client(client_id)
            .or_else(|| table.offer_for(client_id, now))
        {
            Some(index) => index,
            None => match table.free_lease(now, &mut rand::thread_rng()) {
                Some(index) => index,
                None => {
                    warn!(client = %client_id, "Pool exhausted, not offering an address");
                    return Reply::Silent(Silence::PoolExhausted);
                }
            },
        };

        let Some(offered) = table.pool().address(index) else {
            return Reply::Silent(Silence::PoolExhausted);
        };
        table.remember_offer(client_id, index, now);

        info!(client = %client_id, address = %offered, "OFFER");

        Reply::Send(self.build_reply(
            request,
            MessageType::Offer,
            offered,
            self.options.select(parameter_request_list(request)),
        ))
    }

    fn handle_request(
        &self,
        table: &mut LeaseTable,
        request: &Message,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Reply {
        if let Some(server_id) = server_identifier(request)
            && server_id != self.config.server_ip
        {
            info!(client = %client_id, server = %server_id, "REQUEST is for a different server");
            return Reply::Silent(Silence::ForeignServer);
        }

        let Some(requested) = requested_ip(request) else {
            return self.nak(request, client_id, "no requested address");
        };

        let Some(index) = table.pool().index_of(requested) else {
            return self.nak(request, client_id, "requested address outside the pool");
        };

        match table.claim(index, client_id, now, self.config.lease_duration_seconds) {
            Claim::Bound(lease) | Claim::Renewed(lease) => {
                info!(
                    client = %client_id,
                    address = %requested,
                    expires_at = %lease.expires_at,
                    "ACK"
                );
                Reply::Send(self.build_reply(
                    request,
                    MessageType::Ack,
                    requested,
                    self.options.select(parameter_request_list(request)),
                ))
            }
            Claim::OutOfRange => self.nak(request, client_id, "requested address outside the pool"),
            Claim::Conflict { holder } => {
                debug!(client = %client_id, holder = %holder, "Requested address already bound");
                self.nak(request, client_id, "requested address bound to another client")
            }
        }
    }

    fn nak(&self, request: &Message, client_id: &str, reason: &str) -> Reply {
        warn!(client = %client_id, "NAK: {}", reason);

        let mut reply = Message::new_with_id(
            request.xid(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            request.giaddr(),
            request.chaddr(),
        );
        reply.set_opcode(Opcode::BootReply);
        reply.set_flags(request.flags());

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(MessageType::Nak));
        opts.insert(DhcpOption::ServerIdentifier(self.config.server_ip));

        Reply::Send(reply)
    }

    /// Builds an OFFER or ACK for `yiaddr` carrying the lease time and the
    /// selected configured options. `siaddr` and the boot file field point
    /// PXE ROMs at this server.
    fn build_reply(
        &self,
        request: &Message,
        message_type: MessageType,
        yiaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Message {
        let mut reply = Message::new_with_id(
            request.xid(),
            Ipv4Addr::UNSPECIFIED,
            yiaddr,
            self.config.server_ip,
            request.giaddr(),
            request.chaddr(),
        );
        reply.set_opcode(Opcode::BootReply);
        reply.set_flags(request.flags());
        if !self.config.boot_filename.is_empty() {
            reply.set_fname_str(&self.config.boot_filename);
        }

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(message_type));
        opts.insert(DhcpOption::ServerIdentifier(self.config.server_ip));
        opts.insert(DhcpOption::AddressLeaseTime(
            self.config.lease_duration_seconds,
        ));
        for option in options {
            opts.insert(option);
        }

        reply
    }

    /// Snapshot of all lease entries (expired ones included) in pool order.
    pub async fn leases(&self) -> Vec<(Ipv4Addr, Lease)> {
        let table = self.table.lock().await;
        table
            .entries()
            .into_iter()
            .filter_map(|(index, lease)| {
                table
                    .pool()
                    .address(index)
                    .map(|address| (address, lease.clone()))
            })
            .collect()
    }

    /// The lease held by `client_id`, if any.
    pub async fn lease_for(&self, client_id: &str) -> Option<(Ipv4Addr, Lease)> {
        let table = self.table.lock().await;
        let index = table.find_client(client_id)?;
        let address = table.pool().address(index)?;
        table.get(index).map(|lease| (address, lease.clone()))
    }

    /// Count of leases that have not expired yet.
    pub async fn active_lease_count(&self) -> usize {
        let now = Utc::now();
        let table = self.table.lock().await;
        table
            .entries()
            .into_iter()
            .filter(|(_, lease)| !lease.is_expired_at(now))
            .count()
    }
}

/// The DHCP message type (Option 53), if present.
pub fn message_type(message: &Message) -> Option<MessageType> {
    match message.opts().get(OptionCode::MessageType) {
        Some(DhcpOption::MessageType(message_type)) => Some(*message_type),
        _ => None,
    }
}

/// The client hardware address as a lease key, respecting `hlen`.
pub fn client_id(message: &Message) -> String {
    let chaddr = message.chaddr();
    let len = usize::from(message.hlen()).min(chaddr.len());
    format_hardware_address(&chaddr[..len])
}

fn server_identifier(message: &Message) -> Option<Ipv4Addr> {
    match message.opts().get(OptionCode::ServerIdentifier) {
        Some(DhcpOption::ServerIdentifier(ip)) => Some(*ip),
        _ => None,
    }
}

fn requested_ip(message: &Message) -> Option<Ipv4Addr> {
    match message.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => None,
    }
}

fn parameter_request_list(message: &Message) -> Option<&[OptionCode]> {
    match message.opts().get(OptionCode::ParameterRequestList) {
        Some(DhcpOption::ParameterRequestList(codes)) => Some(codes.as_slice()),
        _ => None,
    }
}
