//! Control channel wire schema.
//!
//! Every frame carries a string opcode and at most one payload field.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use crate::config::ProxyConfig;
use crate::endpoint::Endpoint;
use crate::error::{HookError, Result};

pub const OPCODE_PID: &str = "pid";
pub const OPCODE_CONNECT: &str = "connect";
pub const OPCODE_SUBPID: &str = "subpid";
pub const OPCODE_CONFIG: &str = "config";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Address {
    #[prost(fixed32, optional, tag = "1")]
    pub v4_addr: ::core::option::Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub v6_addr: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub domain: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint32, tag = "4")]
    pub port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Config {
    #[prost(message, optional, tag = "1")]
    pub addr: ::core::option::Option<Address>,
    #[prost(bool, optional, tag = "2")]
    pub log: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub subprocess: ::core::option::Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Connect {
    #[prost(uint64, tag = "1")]
    pub handle: u64,
    #[prost(message, optional, tag = "2")]
    pub addr: ::core::option::Option<Address>,
    #[prost(message, optional, tag = "3")]
    pub proxy: ::core::option::Option<Address>,
    #[prost(string, tag = "4")]
    pub syscall: ::prost::alloc::string::String,
}

/// Injected component to controller.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InjecteeMessage {
    #[prost(string, tag = "1")]
    pub opcode: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub connect: ::core::option::Option<Connect>,
    #[prost(uint32, optional, tag = "3")]
    pub pid: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub subpid: ::core::option::Option<u32>,
}

/// Controller to injected component.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InjectorMessage {
    #[prost(string, tag = "1")]
    pub opcode: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub config: ::core::option::Option<Config>,
}

impl From<&Endpoint> for Address {
    fn from(endpoint: &Endpoint) -> Self {
        let mut addr = Address {
            port: endpoint.port() as u32,
            ..Default::default()
        };
        match endpoint {
            Endpoint::V4(v4) => addr.v4_addr = Some(u32::from(*v4.ip())),
            Endpoint::V6(v6) => addr.v6_addr = Some(v6.ip().octets().to_vec()),
            Endpoint::Domain { host, .. } => addr.domain = Some(host.clone()),
        }
        addr
    }
}

impl TryFrom<Address> for Endpoint {
    type Error = HookError;

    fn try_from(addr: Address) -> Result<Self> {
        let port = u16::try_from(addr.port)
            .map_err(|_| HookError::InvalidEndpoint(format!("port {} out of range", addr.port)))?;

        match (addr.v4_addr, addr.v6_addr, addr.domain) {
            (Some(v4), None, None) => Ok(Endpoint::V4(SocketAddrV4::new(Ipv4Addr::from(v4), port))),
            (None, Some(v6), None) => {
                let octets: [u8; 16] = v6.as_slice().try_into().map_err(|_| {
                    HookError::InvalidEndpoint(format!("IPv6 address of {} bytes", v6.len()))
                })?;
                Ok(Endpoint::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
            }
            (None, None, Some(domain)) => Ok(Endpoint::domain(domain, port)),
            _ => Err(HookError::InvalidEndpoint(
                "address must carry exactly one of v4, v6 or domain".to_string(),
            )),
        }
    }
}

impl From<&ProxyConfig> for Config {
    fn from(config: &ProxyConfig) -> Self {
        Config {
            addr: config.proxy.as_ref().map(Address::from),
            log: Some(config.log),
            subprocess: Some(config.subprocess),
        }
    }
}

impl TryFrom<Config> for ProxyConfig {
    type Error = HookError;

    fn try_from(config: Config) -> Result<Self> {
        Ok(ProxyConfig {
            proxy: config.addr.map(Endpoint::try_from).transpose()?,
            log: config.log.unwrap_or(false),
            subprocess: config.subprocess.unwrap_or(false),
        })
    }
}

impl InjecteeMessage {
    pub fn announce_pid(pid: u32) -> Self {
        InjecteeMessage {
            opcode: OPCODE_PID.to_string(),
            pid: Some(pid),
            ..Default::default()
        }
    }

    pub fn connect(connect: Connect) -> Self {
        InjecteeMessage {
            opcode: OPCODE_CONNECT.to_string(),
            connect: Some(connect),
            ..Default::default()
        }
    }

    pub fn subprocess_created(pid: u32) -> Self {
        InjecteeMessage {
            opcode: OPCODE_SUBPID.to_string(),
            subpid: Some(pid),
            ..Default::default()
        }
    }
}

impl InjectorMessage {
    /// Full config snapshot; `None` tells the injectee to drop its config.
    pub fn config(config: Option<&ProxyConfig>) -> Self {
        InjectorMessage {
            opcode: OPCODE_CONFIG.to_string(),
            config: config.map(Config::from),
        }
    }
}
