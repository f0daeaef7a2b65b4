//! Configured DHCP options handed to clients in OFFER and ACK replies.
//!
//! The server carries a small fixed set (subnet mask, router, DNS servers,
//! boot file name). Which of them a reply includes, and in what order, is
//! driven by the client's Parameter Request List (Option 55).
//!
//! # References
//!
//! - RFC 2132 §9.8: Parameter Request List
//! - RFC 2132 §9.5: Bootfile name

use dhcproto::v4::{DhcpOption, OptionCode};

use crate::config::Config;

/// The options this server is configured to hand out, in their default
/// order.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    options: Vec<(OptionCode, DhcpOption)>,
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Self {
        let mut options = vec![(
            OptionCode::SubnetMask,
            DhcpOption::SubnetMask(config.subnet_mask),
        )];

        if let Some(gateway) = config.gateway {
            options.push((OptionCode::Router, DhcpOption::Router(vec![gateway])));
        }

        if !config.dns_servers.is_empty() {
            options.push((
                OptionCode::DomainNameServer,
                DhcpOption::DomainNameServer(config.dns_servers.clone()),
            ));
        }

        if !config.boot_filename.is_empty() {
            options.push((
                OptionCode::BootfileName,
                DhcpOption::BootfileName(config.boot_filename.as_bytes().to_vec()),
            ));
        }

        Self { options }
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn get(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.options
            .iter()
            .find(|(configured, _)| *configured == code)
            .map(|(_, option)| option)
    }

    /// Returns the options named in `parameter_request_list`, in the
    /// client's order, or every configured option when the client sent no
    /// list. Codes the server has no value for are skipped.
    pub fn select(&self, parameter_request_list: Option<&[OptionCode]>) -> Vec<DhcpOption> {
        let Some(prl) = parameter_request_list else {
            return self.options.iter().map(|(_, option)| option.clone()).collect();
        };

        let mut selected: Vec<OptionCode> = Vec::with_capacity(prl.len());
        prl.iter()
            .filter_map(|code| {
                if selected.contains(code) {
                    return None;
                }
                let option = self.get(*code)?;
                selected.push(*code);
                Some(option.clone())
            })
            .collect()
    }
}
